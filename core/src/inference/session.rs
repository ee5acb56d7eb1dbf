//! Inference session: plan, buffers and execution context for one caller.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::binding::{self, ResolvedBinding, TensorNames};
use super::buffers::BufferTable;
use super::loader::CompiledPlan;
use super::preprocess::HostInputBatch;
use crate::backend::{Backend, ExecutionContext};
use crate::diagnostics::{DiagnosticsSink, Severity};
use crate::error::{ForgeError, Result};

/// Lifecycle of an [`InferenceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    PlanLoaded,
    BuffersAllocated,
    Ready,
    Executing,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::PlanLoaded => "plan loaded",
            Self::BuffersAllocated => "buffers allocated",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// Tensor data read back from the device.
#[derive(Debug, Clone)]
pub struct TensorData {
    pub name: String,
    pub data: ArrayD<f32>,
}

impl TensorData {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of samples along the batch axis.
    pub fn batch_size(&self) -> usize {
        self.data.shape().first().copied().unwrap_or(0)
    }

    /// Output of batch item `index`.
    pub fn sample(&self, index: usize) -> Option<ArrayViewD<'_, f32>> {
        (self.data.ndim() > 0 && index < self.batch_size())
            .then(|| self.data.index_axis(Axis(0), index))
    }
}

/// Result of one execution.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub output: TensorData,
    /// Wall time of upload, execution and download.
    pub latency_ms: f64,
}

/// Owns everything needed to run a compiled plan.
///
/// The session moves through [`SessionState`] in order:
/// [`load_plan`](Self::load_plan), [`bind`](Self::bind),
/// [`prepare`](Self::prepare), then any number of [`run`](Self::run) calls.
/// Device buffers, the execution context and the plan are released by
/// [`teardown`](Self::teardown) or on drop.
///
/// # Example
///
/// ```no_run
/// use planforge::backend::CpuBackend;
/// use planforge::diagnostics::TracingSink;
/// use planforge::inference::{InferenceSession, TensorNames};
/// use std::sync::Arc;
///
/// # fn main() -> planforge::Result<()> {
/// let bytes = planforge::store::read_plan("best.plan")?;
/// let mut session = InferenceSession::open(
///     Arc::new(CpuBackend::new()),
///     Arc::new(TracingSink::default()),
///     &bytes,
///     &TensorNames::default(),
///     Some(1),
/// )?;
///
/// let mut batch = session.input_batch()?;
/// batch.fill(0, "image.jpg")?;
/// let result = session.run(&batch)?;
/// println!("{:?} in {:.2}ms", result.output.shape(), result.latency_ms);
/// # Ok(())
/// # }
/// ```
pub struct InferenceSession {
    // field order is drop order: the context goes before the buffers it
    // executes against, and both before the plan
    context: Option<Box<dyn ExecutionContext>>,
    buffers: Option<BufferTable>,
    binding: Option<ResolvedBinding>,
    plan: Option<CompiledPlan>,
    state: SessionState,
    backend: Arc<dyn Backend>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl InferenceSession {
    pub fn new(backend: Arc<dyn Backend>, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            context: None,
            buffers: None,
            binding: None,
            plan: None,
            state: SessionState::Uninitialized,
            backend,
            sink,
        }
    }

    /// Load, bind and prepare in one call.
    pub fn open(
        backend: Arc<dyn Backend>,
        sink: Arc<dyn DiagnosticsSink>,
        plan_bytes: &[u8],
        names: &TensorNames,
        batch_hint: Option<usize>,
    ) -> Result<Self> {
        let mut session = Self::new(backend, sink);
        session.load_plan(plan_bytes)?;
        session.bind(names, batch_hint)?;
        session.prepare()?;
        Ok(session)
    }

    fn expect_state(&self, expected: SessionState, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ForgeError::not_ready(format!(
                "cannot {} while the session is {}",
                action, self.state
            )))
        }
    }

    /// Deserialize plan bytes on the session's backend.
    pub fn load_plan(&mut self, bytes: &[u8]) -> Result<&CompiledPlan> {
        self.expect_state(SessionState::Uninitialized, "load a plan")?;
        let plan = CompiledPlan::load(self.backend.as_ref(), bytes, self.sink.as_ref())?;
        for line in plan.describe() {
            info!("{}", line);
        }
        self.state = SessionState::PlanLoaded;
        Ok(self.plan.insert(plan))
    }

    /// Resolve the named tensors and allocate one device buffer per tensor.
    pub fn bind(&mut self, names: &TensorNames, batch_hint: Option<usize>) -> Result<&ResolvedBinding> {
        self.expect_state(SessionState::PlanLoaded, "bind tensors")?;
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ForgeError::not_ready("no plan loaded"))?;

        let resolved = binding::resolve(plan, names, batch_hint)?;
        // only the named input is uploaded on each run
        if let Some(unfed) = plan
            .tensors()
            .iter()
            .enumerate()
            .find(|&(index, t)| t.is_input() && index != resolved.input_index)
            .map(|(_, t)| t)
        {
            return Err(ForgeError::binding_mismatch(format!(
                "plan input '{}' would never be written; this session only feeds '{}'",
                unfed.name, names.input
            )));
        }
        let buffers = BufferTable::allocate(self.backend.allocator(), plan.tensors(), &resolved.shapes)?;
        debug!(
            "Bound {} tensors at batch {} ({} device bytes)",
            buffers.len(),
            resolved.batch_size,
            buffers.total_bytes()
        );

        self.buffers = Some(buffers);
        self.state = SessionState::BuffersAllocated;
        Ok(self.binding.insert(resolved))
    }

    /// Create the execution context.
    pub fn prepare(&mut self) -> Result<()> {
        self.expect_state(SessionState::BuffersAllocated, "create an execution context")?;
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ForgeError::not_ready("no plan loaded"))?;

        let context = plan.engine().create_context().inspect_err(|e| {
            self.sink.log(Severity::Error, &e.to_string());
        })?;
        self.context = Some(context);
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Empty host batch shaped like the bound input tensor.
    pub fn input_batch(&self) -> Result<HostInputBatch> {
        let binding = self
            .binding
            .as_ref()
            .ok_or_else(|| ForgeError::not_ready("tensors are not bound"))?;
        HostInputBatch::from_shape(binding.input_shape())
    }

    /// Copy `batch` to the device, execute the plan and read the output back.
    ///
    /// # Errors
    ///
    /// [`ForgeError::NotReady`] unless the session is [`SessionState::Ready`],
    /// [`ForgeError::IncompleteBatch`] if any batch slot is unfilled, and
    /// [`ForgeError::BindingMismatch`] if the batch shape differs from the
    /// bound input. Execution failures leave the session ready for another run.
    pub fn run(&mut self, batch: &HostInputBatch) -> Result<InferenceResult> {
        self.expect_state(SessionState::Ready, "execute")?;
        if !batch.is_complete() {
            return Err(ForgeError::IncompleteBatch {
                expected: batch.batch_size(),
                got: batch.filled(),
            });
        }

        self.state = SessionState::Executing;
        let result = self.execute(batch);
        self.state = SessionState::Ready;

        if let Err(e) = &result {
            self.sink.log(Severity::Error, &e.to_string());
        }
        result
    }

    fn execute(&mut self, batch: &HostInputBatch) -> Result<InferenceResult> {
        let (Some(binding), Some(buffers), Some(context)) =
            (&self.binding, &self.buffers, self.context.as_mut())
        else {
            return Err(ForgeError::not_ready("session resources are missing"));
        };
        if batch.shape() != binding.input_shape() {
            return Err(ForgeError::binding_mismatch(format!(
                "host batch is {:?}, bound input is {:?}",
                batch.shape(),
                binding.input_shape()
            )));
        }

        let start = Instant::now();
        buffers.upload(binding.input_index, batch.as_slice()?)?;
        context.execute(&buffers.bindings())?;
        let values = buffers.download(binding.output_index)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let data = ArrayD::from_shape_vec(IxDyn(binding.output_shape()), values)
            .map_err(|e| ForgeError::execution(format!("output shape error: {}", e)))?;
        let name = buffers.slots()[binding.output_index].name.clone();
        debug!("Executed plan in {:.2}ms", latency_ms);

        Ok(InferenceResult {
            output: TensorData { name, data },
            latency_ms,
        })
    }

    /// Release the context, device buffers and plan. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        self.context = None;
        if let Some(mut buffers) = self.buffers.take() {
            buffers.free();
        }
        self.binding = None;
        self.plan = None;
        self.state = SessionState::TornDown;
        debug!("Session torn down");
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn plan(&self) -> Option<&CompiledPlan> {
        self.plan.as_ref()
    }

    pub fn binding(&self) -> Option<&ResolvedBinding> {
        self.binding.as_ref()
    }

    pub fn buffers(&self) -> Option<&BufferTable> {
        self.buffers.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("plan", &self.plan)
            .field("binding", &self.binding)
            .finish()
    }
}

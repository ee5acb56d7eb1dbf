//! Compute backend capability set.
//!
//! A backend turns a [`ModelGraph`] into serialized plan bytes, turns those
//! bytes back into an [`Engine`], and owns the device memory that engines
//! execute against. The pipeline only talks to backends through the traits
//! in this module.

mod cpu;

pub use cpu::{CpuBackend, CpuMemory, DEFAULT_DEVICE_CAPACITY};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::compiler::CompileConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::error::{ForgeError, Result};
use crate::graph::ModelGraph;

/// Device a backend executes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// Host CPU.
    Cpu,
    /// CUDA device with index.
    Cuda(usize),
}

impl Device {
    pub fn cpu() -> Self {
        Self::Cpu
    }

    pub fn cuda(index: usize) -> Self {
        Self::Cuda(index)
    }
}

impl FromStr for Device {
    type Err = ForgeError;

    /// Parse a device string like "cpu", "cuda", "cuda:0", "cuda:1".
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            Ok(Self::Cpu)
        } else if s == "cuda" {
            Ok(Self::Cuda(0))
        } else if let Some(idx) = s.strip_prefix("cuda:") {
            let index: usize = idx
                .parse()
                .map_err(|_| ForgeError::config(format!("Invalid CUDA index: {}", idx)))?;
            Ok(Self::Cuda(index))
        } else {
            Err(ForgeError::config(format!("Invalid device: {}", s)))
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    F32,
    F16,
    I32,
    U8,
}

impl DataType {
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 => 2,
            Self::U8 => 1,
        }
    }
}

/// One tensor dimension. Serialized as an integer where `-1` is dynamic.
///
/// A dynamic first axis is the deferred batch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Dim {
    Dynamic,
    Fixed(usize),
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Dynamic => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

impl From<Dim> for i64 {
    fn from(dim: Dim) -> i64 {
        match dim {
            Dim::Dynamic => -1,
            Dim::Fixed(n) => n as i64,
        }
    }
}

impl TryFrom<i64> for Dim {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Dynamic),
            n if n >= 0 => Ok(Self::Fixed(n as usize)),
            n => Err(format!("invalid dimension {}, expected -1 or a size", n)),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic => write!(f, "-1"),
            Self::Fixed(n) => write!(f, "{}", n),
        }
    }
}

/// Bytes held by a tensor with dimensions `dims`, or `None` if the size does
/// not fit in `usize`.
pub fn checked_byte_len(dims: impl IntoIterator<Item = usize>, dtype: DataType) -> Option<usize> {
    dims.into_iter()
        .try_fold(dtype.size_bytes(), |acc, d| acc.checked_mul(d))
}

/// Render a shape the way plan listings print it: `4 3 640 640`.
pub fn format_shape(shape: &[Dim]) -> String {
    shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorRole {
    Input,
    Output,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "Input"),
            Self::Output => write!(f, "Output"),
        }
    }
}

/// Name, role and shape of one plan input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub role: TensorRole,
    pub shape: Vec<Dim>,
    #[serde(default)]
    pub dtype: DataType,
}

impl TensorDescriptor {
    pub fn is_input(&self) -> bool {
        self.role == TensorRole::Input
    }

    /// Whether the first axis is the deferred batch dimension.
    pub fn has_deferred_batch(&self) -> bool {
        self.shape.first().is_some_and(Dim::is_dynamic)
    }

    /// Concrete shape with the deferred batch axis set to `batch`.
    ///
    /// Returns `None` if any other axis is dynamic.
    pub fn concrete_shape(&self, batch: usize) -> Option<Vec<usize>> {
        self.shape
            .iter()
            .enumerate()
            .map(|(axis, dim)| match (axis, dim) {
                (0, Dim::Dynamic) => Some(batch),
                (_, d) => d.fixed(),
            })
            .collect()
    }
}

/// Opaque handle to a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub(crate) fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> u64 {
        self.0
    }
}

/// A device buffer bound to a named plan tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub ptr: DevicePtr,
    pub byte_len: usize,
}

/// Device buffers handed to an execution context, one per plan tensor and
/// in the plan's tensor order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    entries: Vec<Binding>,
}

impl Bindings {
    pub fn new(entries: Vec<Binding>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.entries.iter().find(|b| b.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.entries.iter()
    }

    /// Check the bindings against a plan's tensor table and return the batch
    /// size they were sized for.
    pub fn validate(&self, tensors: &[TensorDescriptor]) -> Result<usize> {
        if self.entries.len() != tensors.len() {
            return Err(ForgeError::binding_mismatch(format!(
                "plan declares {} tensors but {} buffers were bound",
                tensors.len(),
                self.entries.len()
            )));
        }

        let mut batch: Option<usize> = None;
        for (index, (binding, desc)) in self.entries.iter().zip(tensors).enumerate() {
            if binding.name != desc.name {
                return Err(ForgeError::binding_mismatch(format!(
                    "slot {} is bound to '{}' but the plan declares '{}'",
                    index, binding.name, desc.name
                )));
            }

            let per_sample = desc.concrete_shape(1).ok_or_else(|| {
                ForgeError::ShapeUnderspecified {
                    name: desc.name.clone(),
                    shape: format_shape(&desc.shape),
                }
            })?;
            let sample_bytes =
                checked_byte_len(per_sample, desc.dtype).ok_or_else(|| {
                    ForgeError::binding_mismatch(format!(
                        "tensor '{}' of shape [{}] is too large to address",
                        desc.name,
                        format_shape(&desc.shape)
                    ))
                })?;

            let tensor_batch = if desc.has_deferred_batch() {
                if sample_bytes == 0 || binding.byte_len % sample_bytes != 0 {
                    return Err(ForgeError::binding_mismatch(format!(
                        "buffer for '{}' is {} bytes, not a whole number of {}-byte samples",
                        desc.name, binding.byte_len, sample_bytes
                    )));
                }
                Some(binding.byte_len / sample_bytes)
            } else {
                if binding.byte_len != sample_bytes {
                    return Err(ForgeError::binding_mismatch(format!(
                        "buffer for '{}' is {} bytes, plan requires {}",
                        desc.name, binding.byte_len, sample_bytes
                    )));
                }
                desc.shape.first().and_then(Dim::fixed)
            };

            match (batch, tensor_batch) {
                (Some(b), Some(t)) if b != t => {
                    return Err(ForgeError::binding_mismatch(format!(
                        "buffer for '{}' holds batch {}, other buffers hold batch {}",
                        desc.name, t, b
                    )));
                }
                (None, Some(t)) => batch = Some(t),
                _ => {}
            }
        }

        Ok(batch.unwrap_or(1))
    }
}

/// Device memory owned by a backend.
pub trait DeviceAllocator: Send + Sync {
    fn device(&self) -> &Device;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;

    /// Release an allocation. Unknown pointers are ignored.
    fn free(&self, ptr: DevicePtr);

    /// Blocking host-to-device copy. `src` must match the allocation size.
    fn copy_host_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Blocking device-to-host copy. `dst` must match the allocation size.
    fn copy_device_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    /// Bytes still available for allocation.
    fn available(&self) -> usize;

    /// Bytes currently allocated.
    fn allocated(&self) -> usize;
}

/// A deserialized, runnable plan.
pub trait Engine: Send + Sync {
    /// Declared tensors. The order is fixed for the lifetime of the engine.
    fn tensors(&self) -> &[TensorDescriptor];

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>>;
}

/// Per-run execution state created from an [`Engine`].
pub trait ExecutionContext: Send {
    /// Run the plan against `bindings`. Returns once outputs are written.
    fn execute(&mut self, bindings: &Bindings) -> Result<()>;
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn device(&self) -> &Device;

    /// Build a plan for `graph` and serialize it.
    fn build_serialized(
        &self,
        graph: &ModelGraph,
        config: &CompileConfig,
        sink: &dyn DiagnosticsSink,
    ) -> Result<Vec<u8>>;

    /// Rebuild an engine from serialized plan bytes.
    fn deserialize(&self, bytes: &[u8], sink: &dyn DiagnosticsSink) -> Result<Arc<dyn Engine>>;

    fn allocator(&self) -> Arc<dyn DeviceAllocator>;
}

/// Create the backend that drives `device`.
pub fn for_device(device: &Device) -> Result<Arc<dyn Backend>> {
    match device {
        Device::Cpu => Ok(Arc::new(CpuBackend::new())),
        Device::Cuda(_) => Err(ForgeError::config(format!(
            "No backend available for {}; this build only drives the cpu device",
            device
        ))),
    }
}

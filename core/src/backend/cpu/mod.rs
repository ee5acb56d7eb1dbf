//! Pure-Rust reference backend.
//!
//! Plans are lowered to a small kernel program and executed on the host.
//! Device memory is simulated by [`CpuMemory`], which enforces a fixed
//! capacity so allocation failures behave like they do on an accelerator.

mod codec;
mod memory;
mod program;

pub use memory::{CpuMemory, DEFAULT_DEVICE_CAPACITY};

use std::sync::Arc;

use crate::backend::{
    Backend, Bindings, Device, DeviceAllocator, DevicePtr, Engine, ExecutionContext,
    TensorDescriptor,
};
use crate::compiler::CompileConfig;
use crate::diagnostics::{DiagnosticsSink, Severity};
use crate::error::{ForgeError, Result};
use crate::graph::ModelGraph;
use program::Program;

pub struct CpuBackend {
    device: Device,
    memory: Arc<CpuMemory>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEVICE_CAPACITY)
    }

    /// Backend whose device memory holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            device: Device::Cpu,
            memory: Arc::new(CpuMemory::new(capacity)),
        }
    }

    pub fn memory(&self) -> &Arc<CpuMemory> {
        &self.memory
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu-reference"
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn build_serialized(
        &self,
        graph: &ModelGraph,
        config: &CompileConfig,
        sink: &dyn DiagnosticsSink,
    ) -> Result<Vec<u8>> {
        let program = program::lower(graph, config, sink)?;
        codec::encode(&program, &self.device)
    }

    fn deserialize(&self, bytes: &[u8], sink: &dyn DiagnosticsSink) -> Result<Arc<dyn Engine>> {
        let program = codec::decode(bytes, &self.device)?;
        sink.log(
            Severity::Info,
            &format!(
                "deserialized plan '{}' (format v{}, {} tensors, {} steps)",
                program.name,
                codec::FORMAT_VERSION,
                program.tensors.len(),
                program.steps.len()
            ),
        );
        Ok(Arc::new(CpuEngine {
            program: Arc::new(program),
            memory: Arc::clone(&self.memory),
        }))
    }

    fn allocator(&self) -> Arc<dyn DeviceAllocator> {
        self.memory.clone()
    }
}

struct CpuEngine {
    program: Arc<Program>,
    memory: Arc<CpuMemory>,
}

impl Engine for CpuEngine {
    fn tensors(&self) -> &[TensorDescriptor] {
        &self.program.tensors
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>> {
        let bytes = self.program.workspace_bytes;
        let workspace = if bytes > 0 {
            let ptr = self.memory.alloc(bytes).map_err(|e| {
                ForgeError::context_creation(format!(
                    "cannot reserve {} bytes of workspace: {}",
                    bytes, e
                ))
            })?;
            Some(ptr)
        } else {
            None
        };

        Ok(Box::new(CpuContext {
            program: Arc::clone(&self.program),
            memory: Arc::clone(&self.memory),
            workspace,
        }))
    }
}

struct CpuContext {
    program: Arc<Program>,
    memory: Arc<CpuMemory>,
    workspace: Option<DevicePtr>,
}

impl ExecutionContext for CpuContext {
    fn execute(&mut self, bindings: &Bindings) -> Result<()> {
        self.program.execute(&self.memory, bindings)
    }
}

impl Drop for CpuContext {
    fn drop(&mut self) {
        if let Some(ptr) = self.workspace.take() {
            self.memory.free(ptr);
        }
    }
}

//! Deserializing plan bytes into a runnable plan.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::backend::{format_shape, Backend, Device, Engine, TensorDescriptor};
use crate::diagnostics::{DiagnosticsSink, Severity};
use crate::error::{ForgeError, Result};
use crate::store;

/// A plan deserialized by a backend and bound to that backend's device.
pub struct CompiledPlan {
    engine: Arc<dyn Engine>,
    device: Device,
    size_bytes: usize,
}

impl CompiledPlan {
    /// Deserialize `bytes` on `backend`.
    ///
    /// # Errors
    ///
    /// [`ForgeError::Truncated`] for empty or short input and
    /// [`ForgeError::IncompatiblePlan`] when the backend rejects the bytes,
    /// e.g. because they were built for another device or format version.
    pub fn load(backend: &dyn Backend, bytes: &[u8], sink: &dyn DiagnosticsSink) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ForgeError::truncated("plan is empty"));
        }

        let engine = backend
            .deserialize(bytes, sink)
            .inspect_err(|e| sink.log(Severity::Error, &e.to_string()))?;

        Ok(Self {
            engine,
            device: backend.device().clone(),
            size_bytes: bytes.len(),
        })
    }

    /// Read a plan file and deserialize it.
    pub fn load_file(
        backend: &dyn Backend,
        path: impl AsRef<Path>,
        sink: &dyn DiagnosticsSink,
    ) -> Result<Self> {
        let bytes = store::read_plan(path)?;
        Self::load(backend, &bytes, sink)
    }

    /// Declared tensors in backend order. Repeated calls return the same order.
    pub fn tensors(&self) -> &[TensorDescriptor] {
        self.engine.tensors()
    }

    pub fn tensor(&self, name: &str) -> Option<(usize, &TensorDescriptor)> {
        self.tensors()
            .iter()
            .enumerate()
            .find(|(_, t)| t.name == name)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Size of the serialized plan this was loaded from.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// One line per tensor: `Input tensor: input, shape: -1 3 640 640`.
    pub fn describe(&self) -> Vec<String> {
        self.tensors()
            .iter()
            .map(|t| {
                format!(
                    "{} tensor: {}, shape: {}",
                    t.role,
                    t.name,
                    format_shape(&t.shape)
                )
            })
            .collect()
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl fmt::Debug for CompiledPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPlan")
            .field("device", &self.device)
            .field("size_bytes", &self.size_bytes)
            .field("tensors", &self.tensors())
            .finish()
    }
}

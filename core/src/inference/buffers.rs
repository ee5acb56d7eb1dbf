//! Device buffers backing a session's plan tensors.

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{
    checked_byte_len, Binding, Bindings, DeviceAllocator, DevicePtr, TensorDescriptor,
};
use crate::error::{ForgeError, Result};

/// One device allocation per plan tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlot {
    /// Index of the tensor in plan order.
    pub index: usize,
    pub name: String,
    pub ptr: DevicePtr,
    pub byte_len: usize,
}

/// Owns the device buffers of one session.
///
/// Buffers are released by [`BufferTable::free`] or when the table is dropped,
/// whichever comes first.
pub struct BufferTable {
    allocator: Arc<dyn DeviceAllocator>,
    slots: Vec<BufferSlot>,
}

impl BufferTable {
    /// Allocate one buffer per tensor, sized from `shapes` and the tensor's
    /// element type.
    ///
    /// # Errors
    ///
    /// [`ForgeError::OutOfDeviceMemory`] if any allocation fails. Buffers
    /// allocated earlier in the same call are released before returning.
    pub fn allocate(
        allocator: Arc<dyn DeviceAllocator>,
        tensors: &[TensorDescriptor],
        shapes: &[Vec<usize>],
    ) -> Result<Self> {
        if tensors.len() != shapes.len() {
            return Err(ForgeError::binding_mismatch(format!(
                "{} tensors but {} resolved shapes",
                tensors.len(),
                shapes.len()
            )));
        }

        let mut table = Self {
            allocator,
            slots: Vec::with_capacity(tensors.len()),
        };
        for (index, (desc, shape)) in tensors.iter().zip(shapes).enumerate() {
            let byte_len = checked_byte_len(shape.iter().copied(), desc.dtype).ok_or_else(|| {
                ForgeError::OutOfDeviceMemory {
                    requested: usize::MAX,
                    available: table.allocator.available(),
                }
            })?;
            // on failure `table` drops and releases the slots allocated so far
            let ptr = table.allocator.alloc(byte_len)?;
            debug!("Allocated {} bytes for '{}' ({:?})", byte_len, desc.name, shape);
            table.slots.push(BufferSlot {
                index,
                name: desc.name.clone(),
                ptr,
                byte_len,
            });
        }
        Ok(table)
    }

    /// Release every buffer. Calling this again is a no-op.
    pub fn free(&mut self) {
        for slot in self.slots.drain(..) {
            self.allocator.free(slot.ptr);
        }
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.slots.iter().map(|s| s.byte_len).sum()
    }

    /// Name-addressed bindings in plan order.
    pub fn bindings(&self) -> Bindings {
        Bindings::new(
            self.slots
                .iter()
                .map(|s| Binding {
                    name: s.name.clone(),
                    ptr: s.ptr,
                    byte_len: s.byte_len,
                })
                .collect(),
        )
    }

    fn slot(&self, index: usize) -> Result<&BufferSlot> {
        self.slots.get(index).ok_or_else(|| {
            ForgeError::binding_mismatch(format!(
                "no buffer in slot {} ({} slots allocated)",
                index,
                self.slots.len()
            ))
        })
    }

    /// Copy `data` into the buffer at `index`. Blocks until the copy is done.
    pub fn upload(&self, index: usize, data: &[f32]) -> Result<()> {
        let slot = self.slot(index)?;
        if std::mem::size_of_val(data) != slot.byte_len {
            return Err(ForgeError::binding_mismatch(format!(
                "'{}' expects {} bytes, host data is {} bytes",
                slot.name,
                slot.byte_len,
                std::mem::size_of_val(data)
            )));
        }
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.allocator.copy_host_to_device(slot.ptr, &bytes)
    }

    /// Copy the buffer at `index` back to the host as `f32` values.
    pub fn download(&self, index: usize) -> Result<Vec<f32>> {
        let slot = self.slot(index)?;
        let mut bytes = vec![0u8; slot.byte_len];
        self.allocator.copy_device_to_host(&mut bytes, slot.ptr)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

impl Drop for BufferTable {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for BufferTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferTable")
            .field("device", self.allocator.device())
            .field("slots", &self.slots)
            .finish()
    }
}

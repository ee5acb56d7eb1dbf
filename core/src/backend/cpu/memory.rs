//! Host-resident stand-in for device memory.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::{Device, DeviceAllocator, DevicePtr};
use crate::error::{ForgeError, Result};

/// Default memory capacity of the reference device (2 GiB).
pub const DEFAULT_DEVICE_CAPACITY: usize = 2 << 30;

const FIRST_ADDR: u64 = 0x1000;

#[derive(Debug)]
struct MemoryState {
    next_addr: u64,
    used: usize,
    blocks: HashMap<u64, Vec<u8>>,
}

/// Capacity-limited allocation arena addressed through [`DevicePtr`] handles.
#[derive(Debug)]
pub struct CpuMemory {
    device: Device,
    capacity: usize,
    state: Mutex<MemoryState>,
}

impl CpuMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            device: Device::Cpu,
            capacity,
            state: Mutex::new(MemoryState {
                next_addr: FIRST_ADDR,
                used: 0,
                blocks: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live allocations.
    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_f32(&self, ptr: DevicePtr) -> Result<Vec<f32>> {
        let state = self.lock();
        let block = state
            .blocks
            .get(&ptr.addr())
            .ok_or_else(|| unknown_pointer(ptr))?;
        Ok(block
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub(crate) fn write_f32(&self, ptr: DevicePtr, values: &[f32]) -> Result<()> {
        let mut state = self.lock();
        let block = state
            .blocks
            .get_mut(&ptr.addr())
            .ok_or_else(|| unknown_pointer(ptr))?;
        if block.len() != values.len() * 4 {
            return Err(ForgeError::binding_mismatch(format!(
                "writing {} values into a {} byte buffer",
                values.len(),
                block.len()
            )));
        }
        for (dst, v) in block.chunks_exact_mut(4).zip(values) {
            dst.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }
}

fn unknown_pointer(ptr: DevicePtr) -> ForgeError {
    ForgeError::binding_mismatch(format!("unknown device pointer {:#x}", ptr.addr()))
}

impl DeviceAllocator for CpuMemory {
    fn device(&self) -> &Device {
        &self.device
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.lock();
        let available = self.capacity - state.used;
        if bytes > available {
            return Err(ForgeError::OutOfDeviceMemory {
                requested: bytes,
                available,
            });
        }
        let addr = state.next_addr;
        state.next_addr += 1;
        state.used += bytes;
        state.blocks.insert(addr, vec![0u8; bytes]);
        Ok(DevicePtr::new(addr))
    }

    fn free(&self, ptr: DevicePtr) {
        let mut state = self.lock();
        if let Some(block) = state.blocks.remove(&ptr.addr()) {
            state.used -= block.len();
        }
    }

    fn copy_host_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let block = state
            .blocks
            .get_mut(&dst.addr())
            .ok_or_else(|| unknown_pointer(dst))?;
        if block.len() != src.len() {
            return Err(ForgeError::binding_mismatch(format!(
                "host-to-device copy of {} bytes into a {} byte buffer",
                src.len(),
                block.len()
            )));
        }
        block.copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let state = self.lock();
        let block = state
            .blocks
            .get(&src.addr())
            .ok_or_else(|| unknown_pointer(src))?;
        if block.len() != dst.len() {
            return Err(ForgeError::binding_mismatch(format!(
                "device-to-host copy of a {} byte buffer into {} bytes",
                block.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(block);
        Ok(())
    }

    fn available(&self) -> usize {
        self.capacity - self.lock().used
    }

    fn allocated(&self) -> usize {
        self.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_respects_capacity() {
        let memory = CpuMemory::new(64);
        let a = memory.alloc(48).unwrap();
        assert_eq!(memory.available(), 16);

        let err = memory.alloc(32).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::OutOfDeviceMemory {
                requested: 32,
                available: 16
            }
        ));

        memory.free(a);
        assert_eq!(memory.allocated(), 0);
        assert!(memory.alloc(64).is_ok());
    }

    #[test]
    fn test_free_unknown_pointer_is_ignored() {
        let memory = CpuMemory::new(16);
        let a = memory.alloc(8).unwrap();
        memory.free(a);
        memory.free(a);
        assert_eq!(memory.allocated(), 0);
        assert_eq!(memory.block_count(), 0);
    }

    #[test]
    fn test_copies_check_sizes() {
        let memory = CpuMemory::new(1024);
        let ptr = memory.alloc(8).unwrap();
        let src = [1.5f32, -2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>();
        memory.copy_host_to_device(ptr, &src).unwrap();
        assert_eq!(memory.read_f32(ptr).unwrap(), vec![1.5, -2.0]);

        let mut short = [0u8; 4];
        assert!(memory.copy_device_to_host(&mut short, ptr).is_err());
        assert!(memory.copy_host_to_device(ptr, &src[..4]).is_err());
    }
}

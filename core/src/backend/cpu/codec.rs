//! Binary plan format.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "PFPL"
//!      4     2  format version (LE)
//!      6     1  device kind (0 = cpu, 1 = cuda)
//!      7     1  device index
//!      8     8  payload length (LE)
//!     16     n  payload
//! ```

use super::program::Program;
use crate::backend::Device;
use crate::error::{ForgeError, Result};

const MAGIC: [u8; 4] = *b"PFPL";
pub(crate) const FORMAT_VERSION: u16 = 1;
pub(crate) const HEADER_LEN: usize = 16;

fn device_tag(device: &Device) -> Result<[u8; 2]> {
    match device {
        Device::Cpu => Ok([0, 0]),
        Device::Cuda(idx) => u8::try_from(*idx)
            .map(|i| [1, i])
            .map_err(|_| ForgeError::config(format!("device index {} out of range", idx))),
    }
}

fn describe_tag(tag: [u8; 2]) -> String {
    match tag {
        [0, _] => "cpu".to_string(),
        [1, idx] => format!("cuda:{}", idx),
        [kind, idx] => format!("unknown device {}:{}", kind, idx),
    }
}

pub(crate) fn encode(program: &Program, device: &Device) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(program)?;
    let tag = device_tag(device)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&tag);
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub(crate) fn decode(bytes: &[u8], device: &Device) -> Result<Program> {
    if bytes.is_empty() {
        return Err(ForgeError::truncated("plan is empty"));
    }
    if bytes.len() < HEADER_LEN {
        return Err(ForgeError::truncated(format!(
            "plan is {} bytes, header alone is {}",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[0..4] != MAGIC {
        return Err(ForgeError::incompatible("not a planforge plan"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(ForgeError::incompatible(format!(
            "plan format v{} cannot be read by this runtime (v{})",
            version, FORMAT_VERSION
        )));
    }

    let tag = [header[6], header[7]];
    if tag != device_tag(device)? {
        return Err(ForgeError::incompatible(format!(
            "plan was built for {}, runtime device is {}",
            describe_tag(tag),
            device
        )));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&header[8..16]);
    let declared = u64::from_le_bytes(len);
    if (payload.len() as u64) < declared {
        return Err(ForgeError::truncated(format!(
            "plan payload is {} bytes, header declares {}",
            payload.len(),
            declared
        )));
    }
    if payload.len() as u64 > declared {
        return Err(ForgeError::incompatible(format!(
            "{} unexpected bytes after plan payload",
            payload.len() as u64 - declared
        )));
    }

    serde_json::from_slice(payload)
        .map_err(|e| ForgeError::incompatible(format!("unreadable plan payload: {}", e)))
}

//! Reading and writing serialized plans.

use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{ForgeError, Result};

/// Write plan bytes to `path`.
///
/// The bytes go to a sibling temporary file that is renamed into place, so a
/// failed write never leaves a partial plan at `path`.
pub fn write_plan(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .ok_or_else(|| ForgeError::config(format!("Invalid plan path: {}", path.display())))?;
    let staging = path.with_file_name(format!(".{}.partial", file_name.to_string_lossy()));

    fs::write(&staging, bytes)?;
    if let Err(e) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    debug!("Wrote {} plan bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Read plan bytes from `path`.
pub fn read_plan(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ForgeError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    debug!("Read {} plan bytes from {}", bytes.len(), path.display());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.plan");
        write_plan(&path, b"PFPL-bytes").unwrap();
        assert_eq!(read_plan(&path).unwrap(), b"PFPL-bytes");
        assert!(!dir.path().join(".best.plan.partial").exists());
    }

    #[test]
    fn test_read_missing_plan() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_plan(dir.path().join("missing.plan")),
            Err(ForgeError::FileNotFound(_))
        ));
    }
}

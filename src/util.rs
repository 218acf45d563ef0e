//! Shared utility functions.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp as seconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    unix_seconds(SystemTime::now())
}

/// Convert a system time to seconds since Unix epoch.
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Write a file atomically: write a sibling temp file, fsync, rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::storage("write file", format!("{} has no parent", path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::storage("create temp file", e.to_string()))?;
    tmp.write_all(contents)
        .map_err(|e| Error::storage("write temp file", e.to_string()))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::storage("sync temp file", e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| Error::storage("persist file", e.error.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        write_atomic(&path, b"123").unwrap();
        write_atomic(&path, b"456").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "456");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}

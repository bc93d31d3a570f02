//! Atomic filesystem primitives shared by the blob store, working-tree
//! writes, and HEAD updates.
//!
//! `atomic_write` guarantees that a concurrent reader of the target path sees
//! either the old content or the new content, never a partial file: bytes go
//! to a sibling temp file, the temp file is fsynced, then renamed over the
//! target, and on unix the parent directory is fsynced so the rename itself
//! is durable.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::errors::{MokuError, Result};

/// Create `dir` and any missing ancestors.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Write `bytes` to `path` atomically via a sibling temp file and rename.
///
/// The parent directory is created if missing. The temp file lives in the
/// same directory as the target so the rename never crosses filesystems.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| MokuError::Storage(format!("{} has no parent directory", path.display())))?;
    ensure_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| MokuError::Storage(format!("persist {}: {}", path.display(), e.error)))?;

    sync_dir(dir)?;
    Ok(())
}

/// Fsync a directory so a completed rename survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::atomic_write;

    /// Writing to a fresh path creates the file with exact content.
    #[test]
    fn write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("HEAD");
        atomic_write(&target, b"abc123").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"abc123");
    }

    /// Writing over an existing file fully replaces its content.
    #[test]
    fn write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("HEAD");
        atomic_write(&target, b"old-version-id").unwrap();
        atomic_write(&target, b"new").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    /// Missing parent directories are created on demand.
    #[test]
    fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c/.page_body");
        atomic_write(&target, b"body").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"body");
    }

    /// No temp files are left behind after a successful write.
    #[test]
    fn no_temp_residue() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file");
        atomic_write(&target, b"x").unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}

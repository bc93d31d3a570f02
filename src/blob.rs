//! Content-addressed blob storage.
//!
//! Every blob is an immutable byte sequence identified by the lowercase hex
//! SHA-256 of its content and stored once at `{root}/{id[0:2]}/{id}`. The
//! two-level layout bounds per-directory fan-out. Writes go through the
//! atomic primitive, so concurrent `put` calls of identical bytes are benign:
//! whichever rename lands last installs byte-identical content.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::errors::{MokuError, Result};
use crate::fsutil;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content-addressed immutable blob store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fsutil::ensure_dir(&root)?;
        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes`, returning the blob ID. Idempotent: re-putting existing
    /// content returns the same ID without rewriting the file.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let id = sha256_hex(bytes);
        let path = self.path_for(&id)?;
        if path.exists() {
            return Ok(id);
        }
        fsutil::atomic_write(&path, bytes)?;
        Ok(id)
    }

    /// Store a stream without holding all bytes in memory: content is hashed
    /// while it is copied into a temp file, which is then renamed into place.
    pub fn put_reader<R: Read>(&self, mut reader: R) -> Result<String> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        let id = hex::encode(hasher.finalize());

        let path = self.path_for(&id)?;
        if path.exists() {
            // Content already stored; the temp file is discarded on drop.
            return Ok(id);
        }
        if let Some(dir) = path.parent() {
            fsutil::ensure_dir(dir)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| MokuError::Storage(format!("persist blob {id}: {}", e.error)))?;
        Ok(id)
    }

    /// Read a blob back, verifying its content against the ID.
    pub fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MokuError::NotFound(format!("blob {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        if sha256_hex(&bytes) != id {
            return Err(MokuError::Integrity(id.to_string()));
        }
        Ok(bytes)
    }

    /// Whether a blob with this ID is present.
    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Remove a blob file. Reserved for future garbage collection; the
    /// engine never calls this on the commit or query paths.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MokuError::NotFound(format!("blob {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Two-level path for a blob ID. IDs shorter than two characters or
    /// containing non-hex characters are rejected before touching the
    /// filesystem.
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.len() < 2 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MokuError::InvalidInput(format!("invalid blob id `{id}`")));
        }
        Ok(self.root.join(&id[..2]).join(id))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{BlobStore, sha256_hex};
    use crate::errors::MokuError;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    /// put/get round-trips byte-exact content.
    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        let id = store.put(b"<html>hello</html>").unwrap();
        assert_eq!(store.get(&id).unwrap(), b"<html>hello</html>");
    }

    /// The ID is the SHA-256 of the content and the file lands under the
    /// two-level fan-out directory.
    #[test]
    fn id_is_sha256_and_fanout_path() {
        let (_dir, store) = store();
        let id = store.put(b"abc").unwrap();
        assert_eq!(
            id,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(store.root().join(&id[..2]).join(&id).is_file());
    }

    /// Putting identical bytes twice yields the same ID and a single file.
    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        let shard = store.root().join(&a[..2]);
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
    }

    /// put_reader produces the same ID as put for the same content.
    #[test]
    fn put_reader_matches_put() {
        let (_dir, store) = store();
        let body = vec![7u8; 200_000];
        let from_bytes = store.put(&body).unwrap();
        let from_reader = store.put_reader(Cursor::new(body.clone())).unwrap();
        assert_eq!(from_bytes, from_reader);
        assert_eq!(store.get(&from_reader).unwrap(), body);
    }

    /// Corrupting the stored file surfaces an integrity error on read.
    #[test]
    fn corrupted_blob_fails_integrity() {
        let (_dir, store) = store();
        let id = store.put(b"payload").unwrap();
        let path = store.root().join(&id[..2]).join(&id);
        std::fs::write(&path, b"tampered").unwrap();
        match store.get(&id) {
            Err(MokuError::Integrity(bad)) => assert_eq!(bad, id),
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    /// Missing blobs are NotFound, not I/O errors.
    #[test]
    fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let id = sha256_hex(b"never stored");
        assert!(matches!(store.get(&id), Err(MokuError::NotFound(_))));
        assert!(!store.exists(&id));
    }

    /// IDs shorter than two characters are rejected as invalid.
    #[test]
    fn short_id_rejected() {
        let (_dir, store) = store();
        assert!(matches!(store.get("a"), Err(MokuError::InvalidInput(_))));
    }

    /// IDs with path-traversal characters never reach the filesystem.
    #[test]
    fn non_hex_id_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("../../etc/passwd"),
            Err(MokuError::InvalidInput(_))
        ));
    }

    /// delete removes the file; a second delete reports NotFound.
    #[test]
    fn delete_then_not_found() {
        let (_dir, store) = store();
        let id = store.put(b"to be removed").unwrap();
        store.delete(&id).unwrap();
        assert!(!store.exists(&id));
        assert!(matches!(store.delete(&id), Err(MokuError::NotFound(_))));
    }
}

//! Content-addressed blob store.
//!
//! The address of a byte string is its SHA-256 digest rendered as lowercase
//! hex.  On disk, objects live in a two-level fanout keyed by the first two
//! hex characters of the hash, one file per object.  Writes go through a
//! temp file and a rename so a crash never leaves a half-written object
//! under its final name.
//!
//! The store is process-wide shared state but append-only and key-safe, so
//! it needs no lock.  A stored object whose rehash no longer matches its key
//! is treated as absent.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

/// Lowercase hex SHA-256 of `bytes` — the store's key function.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Store `bytes`, returning the content hash.  Idempotent: writing the
    /// same bytes twice leaves a single stored copy.
    pub fn put(&self, bytes: &[u8]) -> Result<String, EngineError> {
        let hash = content_hash(bytes);
        let path = self.object_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        let dir = path.parent().expect("object path always has a fanout parent");
        fs::create_dir_all(dir)?;

        // Write to a temp name in the same directory, flush, then rename.
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(dir);

        Ok(hash)
    }

    /// Full bytes for `hash`, or `None` if absent or corrupt.
    pub fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, EngineError> {
        if !is_valid_hash(hash) {
            return Ok(None);
        }
        let path = self.object_path(hash);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content_hash(&bytes) != hash {
            warn!(%hash, "blob rehash mismatch, treating object as absent");
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    /// Bytes in `[start, end)` of the object, clamped to the stored length.
    /// `None` when the key is absent or corrupt.
    pub fn get_slice(
        &self,
        hash: &str,
        start: usize,
        end: usize,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let Some(bytes) = self.get(hash)? else {
            return Ok(None);
        };
        let start = start.min(bytes.len());
        let end = end.clamp(start, bytes.len());
        Ok(Some(bytes[start..end].to_vec()))
    }

    pub fn exists(&self, hash: &str) -> bool {
        is_valid_hash(hash) && self.object_path(hash).exists()
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(hash)
    }
}

/// Flush directory metadata so a freshly renamed object survives a crash.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store() -> (TempDir, BlobStore) {
        let temp = TempDir::new().expect("tempdir");
        let store = BlobStore::open(&temp.path().join("blobs")).expect("open blob store");
        (temp, store)
    }

    #[test]
    fn put_is_idempotent() {
        let (_t, store) = make_store();
        let h1 = store.put(b"hello blob").unwrap();
        let h2 = store.put(b"hello blob").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.get(&h1).unwrap().unwrap(), b"hello blob");
    }

    #[test]
    fn fanout_layout() {
        let (_t, store) = make_store();
        let h = store.put(b"fanout").unwrap();
        assert!(store.root.join(&h[..2]).join(&h).exists());
    }

    #[test]
    fn get_absent_returns_none() {
        let (_t, store) = make_store();
        let fake = "a".repeat(64);
        assert!(store.get(&fake).unwrap().is_none());
        assert!(!store.exists(&fake));
    }

    #[test]
    fn malformed_hash_is_absent_not_traversal() {
        let (_t, store) = make_store();
        assert!(store.get("../../etc/passwd").unwrap().is_none());
        assert!(store.get_slice("zz", 0, 10).unwrap().is_none());
    }

    #[test]
    fn slice_clamps_to_length() {
        let (_t, store) = make_store();
        let h = store.put(b"0123456789").unwrap();
        assert_eq!(store.get_slice(&h, 2, 5).unwrap().unwrap(), b"234");
        assert_eq!(store.get_slice(&h, 8, 100).unwrap().unwrap(), b"89");
        assert_eq!(store.get_slice(&h, 50, 60).unwrap().unwrap(), b"");
    }

    #[test]
    fn corrupt_object_is_absent() {
        let (_t, store) = make_store();
        let h = store.put(b"pristine bytes").unwrap();
        fs::write(store.object_path(&h), b"tampered").unwrap();
        assert!(store.get(&h).unwrap().is_none());
        assert!(store.get_slice(&h, 0, 4).unwrap().is_none());
    }

    #[test]
    fn no_temp_residue_after_put() {
        let (_t, store) = make_store();
        let h = store.put(b"clean write").unwrap();
        let dir = store.root.join(&h[..2]);
        let residue: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(residue.is_empty());
    }
}

//! On-disk index snapshots with fingerprinted staleness.
//!
//! Per session, two files under `indexes/<session id>/`: `index` (the
//! serialized BM25 payload) and `metadata` (the fingerprint record).  Both
//! are written to temp names in the same directory, flushed, then
//! rename-replaced, so a crash at any point leaves the previous state
//! intact.  The read side treats any absent, unreadable, or
//! version-mismatched file as "no snapshot" and deletes the residue —
//! corruption is self-healing by rebuild.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::Bm25Index;
use crate::error::EngineError;
use crate::store::meta::now_iso8601;

/// Bumped whenever the snapshot wire format changes; snapshots of other
/// versions are treated as stale.
pub const INDEX_VERSION: u32 = 1;

const INDEX_FILE: &str = "index";
const META_FILE: &str = "metadata";
const INDEX_TMP: &str = "index.tmp";
const META_TMP: &str = "metadata.tmp";

/// The staleness record stored next to each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub index_version: u32,
    pub created_at: String,
    pub doc_count: u64,
    pub tokenizer: String,
    pub doc_fingerprint: String,
}

impl IndexMeta {
    pub fn new(doc_count: u64, tokenizer: &str, doc_fingerprint: String) -> Self {
        IndexMeta {
            index_version: INDEX_VERSION,
            created_at: now_iso8601(),
            doc_count,
            tokenizer: tokenizer.to_string(),
            doc_fingerprint,
        }
    }

    /// Fresh iff doc count, fingerprint, and tokenizer all match the
    /// session's current state.
    pub fn is_fresh(&self, doc_count: u64, tokenizer: &str, doc_fingerprint: &str) -> bool {
        self.index_version == INDEX_VERSION
            && self.doc_count == doc_count
            && self.tokenizer == tokenizer
            && self.doc_fingerprint == doc_fingerprint
    }
}

/// SHA-256 over the concatenated content hashes, which the caller supplies
/// in ascending document-id order.
pub fn compute_fingerprint(pairs: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    for (_, content_hash) in pairs {
        hasher.update(content_hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Atomic snapshot write: both files land via rename-replace, and no
    /// temp files remain on success.
    pub fn save(
        &self,
        session_id: &str,
        index: &Bm25Index,
        meta: &IndexMeta,
    ) -> Result<(), EngineError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)?;

        let index_bytes = serde_json::to_vec(index)
            .map_err(|e| EngineError::Meta(format!("index: serialize snapshot: {e}")))?;
        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| EngineError::Meta(format!("index: serialize metadata: {e}")))?;

        write_flushed(&dir.join(INDEX_TMP), &index_bytes)?;
        write_flushed(&dir.join(META_TMP), &meta_bytes)?;

        fs::rename(dir.join(INDEX_TMP), dir.join(INDEX_FILE))?;
        fs::rename(dir.join(META_TMP), dir.join(META_FILE))?;
        sync_dir(&dir);
        Ok(())
    }

    /// Read protocol: return the snapshot only when both files parse at the
    /// current version; otherwise clean the directory and report none.
    pub fn load(&self, session_id: &str) -> Result<Option<(Bm25Index, IndexMeta)>, EngineError> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(None);
        }

        // Crash residue from an interrupted writer is never observed as data.
        remove_if_present(&dir.join(INDEX_TMP));
        remove_if_present(&dir.join(META_TMP));

        match self.try_read(&dir) {
            Ok(loaded) => Ok(Some(loaded)),
            Err(e) => {
                warn!(%session_id, error = %e, "discarding unreadable index snapshot");
                self.invalidate(session_id)?;
                Ok(None)
            }
        }
    }

    fn try_read(&self, dir: &Path) -> Result<(Bm25Index, IndexMeta), EngineError> {
        let meta_bytes = fs::read(dir.join(META_FILE))
            .map_err(|e| EngineError::IndexCorrupt(format!("read metadata: {e}")))?;
        let meta: IndexMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| EngineError::IndexCorrupt(format!("decode metadata: {e}")))?;
        if meta.index_version != INDEX_VERSION {
            return Err(EngineError::IndexCorrupt(format!(
                "snapshot version {} != supported {INDEX_VERSION}",
                meta.index_version
            )));
        }

        let index_bytes = fs::read(dir.join(INDEX_FILE))
            .map_err(|e| EngineError::IndexCorrupt(format!("read index: {e}")))?;
        let index: Bm25Index = serde_json::from_slice(&index_bytes)
            .map_err(|e| EngineError::IndexCorrupt(format!("decode index: {e}")))?;

        Ok((index, meta))
    }

    /// Delete the session's snapshot files (and directory, if now empty).
    pub fn invalidate(&self, session_id: &str) -> Result<(), EngineError> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(());
        }
        for name in [INDEX_FILE, META_FILE, INDEX_TMP, META_TMP] {
            remove_if_present(&dir.join(name));
        }
        let _ = fs::remove_dir(&dir);
        Ok(())
    }
}

fn write_flushed(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let mut f = fs::File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove snapshot file");
        }
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

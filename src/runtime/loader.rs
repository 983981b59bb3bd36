//! Bounded concurrent document loader for `docs.load`.
//!
//! Source specs expand to concrete loads (inline literals and file paths);
//! every concrete load runs as its own task behind a counting semaphore so
//! at most `max_concurrent_loads` files are held in memory at once.
//! Failures are collected per source and never cancel the siblings; the
//! caller commits the surviving rows in a single batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::LoaderConfig;
use crate::store::blob::BlobStore;
use crate::store::meta::{DocumentRow, now_iso8601};
use crate::tools::{LoadFailure, SourceSpec};

const DEFAULT_DIR_PATTERN: &str = "**/*";

/// One expanded unit of work.
#[derive(Debug, Clone)]
enum Concrete {
    Inline { name: String, text: String },
    File { path: PathBuf },
}

impl Concrete {
    fn describe(&self) -> String {
        match self {
            Concrete::Inline { name, .. } => format!("inline:{name}"),
            Concrete::File { path } => format!("file:{}", path.display()),
        }
    }
}

fn failure(source: String, kind: &str, message: String) -> LoadFailure {
    LoadFailure {
        source,
        kind: kind.to_string(),
        message,
    }
}

/// Expand directory and glob sources to concrete loads, rejecting oversized
/// and missing paths up front.
fn expand_sources(
    sources: &[SourceSpec],
    cfg: &LoaderConfig,
    failures: &mut Vec<LoadFailure>,
) -> Vec<Concrete> {
    let max_bytes = cfg.max_file_size_mb * 1024 * 1024;
    let mut concrete = Vec::new();
    let mut inline_seq = 0usize;

    for spec in sources {
        match spec {
            SourceSpec::Inline { text, name } => {
                inline_seq += 1;
                let name = name
                    .clone()
                    .unwrap_or_else(|| format!("inline-{inline_seq}"));
                concrete.push(Concrete::Inline {
                    name,
                    text: text.clone(),
                });
            }
            SourceSpec::File { path } => {
                let path = PathBuf::from(path);
                if let Some(c) = check_file(&path, max_bytes, spec, failures) {
                    concrete.push(c);
                }
            }
            SourceSpec::Dir { path, pattern } => {
                let dir = Path::new(path);
                if !dir.is_dir() {
                    failures.push(failure(
                        spec.describe(),
                        "FileNotFound",
                        format!("not a directory: {path}"),
                    ));
                    continue;
                }
                let pattern = format!(
                    "{}/{}",
                    path.trim_end_matches('/'),
                    pattern.as_deref().unwrap_or(DEFAULT_DIR_PATTERN)
                );
                expand_glob(&pattern, max_bytes, spec, &mut concrete, failures);
            }
            SourceSpec::Glob { pattern } => {
                expand_glob(pattern, max_bytes, spec, &mut concrete, failures);
            }
        }
    }
    concrete
}

fn expand_glob(
    pattern: &str,
    max_bytes: u64,
    spec: &SourceSpec,
    concrete: &mut Vec<Concrete>,
    failures: &mut Vec<LoadFailure>,
) {
    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            failures.push(failure(
                spec.describe(),
                "InvalidArgument",
                format!("invalid glob pattern {pattern}: {e}"),
            ));
            return;
        }
    };

    let mut matched = 0usize;
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => {
                matched += 1;
                if let Some(c) = check_file(&path, max_bytes, spec, failures) {
                    concrete.push(c);
                }
            }
            Ok(_) => {}
            Err(e) => failures.push(failure(
                spec.describe(),
                "Io",
                format!("glob entry error: {e}"),
            )),
        }
    }
    if matched == 0 {
        failures.push(failure(
            spec.describe(),
            "FileNotFound",
            format!("no files matched {pattern}"),
        ));
    }
}

fn check_file(
    path: &Path,
    max_bytes: u64,
    spec: &SourceSpec,
    failures: &mut Vec<LoadFailure>,
) -> Option<Concrete> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            failures.push(failure(
                spec.describe(),
                "FileNotFound",
                format!("missing file: {}", path.display()),
            ));
            return None;
        }
    };
    if meta.len() > max_bytes {
        failures.push(failure(
            spec.describe(),
            "FileTooLarge",
            format!(
                "{} is {} bytes, cap is {} bytes",
                path.display(),
                meta.len(),
                max_bytes
            ),
        ));
        return None;
    }
    Some(Concrete::File {
        path: path.to_path_buf(),
    })
}

/// Load every concrete source concurrently and return the document rows
/// ready for the batch commit, in source order, plus the per-source errors.
pub async fn load_sources(
    blobs: Arc<BlobStore>,
    session_id: &str,
    sources: &[SourceSpec],
    cfg: &LoaderConfig,
) -> (Vec<DocumentRow>, Vec<LoadFailure>) {
    let mut failures = Vec::new();
    let concrete = expand_sources(sources, cfg, &mut failures);
    debug!(
        session_id,
        sources = sources.len(),
        concrete = concrete.len(),
        "expanded load sources"
    );

    let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_loads));
    let mut tasks: JoinSet<(usize, Result<DocumentRow, LoadFailure>)> = JoinSet::new();

    for (idx, source) in concrete.into_iter().enumerate() {
        let blobs = Arc::clone(&blobs);
        let semaphore = Arc::clone(&semaphore);
        let session_id = session_id.to_string();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("loader semaphore never closes");
            (idx, load_one(blobs, &session_id, source).await)
        });
    }

    let mut by_index: HashMap<usize, DocumentRow> = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, Ok(row))) => {
                by_index.insert(idx, row);
            }
            Ok((_, Err(f))) => failures.push(f),
            Err(e) => failures.push(failure(
                "loader".to_string(),
                "Io",
                format!("load task panicked: {e}"),
            )),
        }
    }

    let mut indices: Vec<usize> = by_index.keys().copied().collect();
    indices.sort_unstable();
    let rows = indices
        .into_iter()
        .map(|i| by_index.remove(&i).expect("index collected above"))
        .collect();
    (rows, failures)
}

async fn load_one(
    blobs: Arc<BlobStore>,
    session_id: &str,
    source: Concrete,
) -> Result<DocumentRow, LoadFailure> {
    let described = source.describe();
    let (name, source_kind, source_path, text) = match source {
        Concrete::Inline { name, text } => (name, "inline", None, text),
        Concrete::File { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| failure(described.clone(), "FileNotFound", format!("{e}")))?;
            let text = String::from_utf8(bytes).map_err(|e| {
                failure(
                    described.clone(),
                    "DecodeError",
                    format!("{} is not valid UTF-8: {e}", path.display()),
                )
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            (name, "file", Some(path.display().to_string()), text)
        }
    };

    let content_hash = {
        let blobs = Arc::clone(&blobs);
        let bytes = text.clone().into_bytes();
        tokio::task::spawn_blocking(move || blobs.put(&bytes))
            .await
            .map_err(|e| failure(described.clone(), "Io", format!("blob task join: {e}")))?
            .map_err(|e| failure(described.clone(), "Io", format!("blob write: {e}")))?
    };

    Ok(DocumentRow {
        id: uuid::Uuid::now_v7().to_string(),
        session_id: session_id.to_string(),
        content_hash,
        source_kind: source_kind.to_string(),
        source_path,
        name,
        length_chars: text.len() as u64,
        created_at: now_iso8601(),
        metadata: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<BlobStore>, LoaderConfig) {
        let temp = TempDir::new().unwrap();
        let blobs = Arc::new(BlobStore::open(&temp.path().join("blobs")).unwrap());
        let cfg = ServerConfig::test_default(temp.path()).loader;
        (temp, blobs, cfg)
    }

    fn inline(text: &str) -> SourceSpec {
        SourceSpec::Inline {
            text: text.to_string(),
            name: None,
        }
    }

    #[tokio::test]
    async fn inline_sources_load() {
        let (_t, blobs, cfg) = setup();
        let (rows, errors) =
            load_sources(blobs.clone(), "s1", &[inline("ok-1"), inline("ok-2")], &cfg).await;
        assert_eq!(rows.len(), 2);
        assert!(errors.is_empty());
        assert_eq!(rows[0].name, "inline-1");
        assert!(blobs.exists(&rows[0].content_hash));
    }

    #[tokio::test]
    async fn missing_file_fails_without_cancelling_siblings() {
        let (_t, blobs, cfg) = setup();
        let sources = vec![
            inline("ok-1"),
            SourceSpec::File {
                path: "/nonexistent/path.txt".to_string(),
            },
            inline("ok-2"),
        ];
        let (rows, errors) = load_sources(blobs, "s1", &sources, &cfg).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "FileNotFound");
        assert!(errors[0].message.contains("path.txt") || errors[0].source.contains("path.txt"));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let (temp, blobs, mut cfg) = setup();
        cfg.max_file_size_mb = 1;
        let big = temp.path().join("big.txt");
        std::fs::write(&big, vec![b'x'; 2 * 1024 * 1024]).unwrap();

        let sources = vec![SourceSpec::File {
            path: big.display().to_string(),
        }];
        let (rows, errors) = load_sources(blobs, "s1", &sources, &cfg).await;
        assert!(rows.is_empty());
        assert_eq!(errors[0].kind, "FileTooLarge");
    }

    #[tokio::test]
    async fn non_utf8_file_is_a_decode_error() {
        let (temp, blobs, cfg) = setup();
        let bad = temp.path().join("bad.bin");
        std::fs::write(&bad, [0xff, 0xfe, 0x00, 0x41]).unwrap();

        let sources = vec![SourceSpec::File {
            path: bad.display().to_string(),
        }];
        let (rows, errors) = load_sources(blobs, "s1", &sources, &cfg).await;
        assert!(rows.is_empty());
        assert_eq!(errors[0].kind, "DecodeError");
    }

    #[tokio::test]
    async fn dir_source_expands_files() {
        let (temp, blobs, cfg) = setup();
        let dir = temp.path().join("corpus");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.join("nested").join("b.txt"), "beta").unwrap();

        let sources = vec![SourceSpec::Dir {
            path: dir.display().to_string(),
            pattern: None,
        }];
        let (rows, errors) = load_sources(blobs, "s1", &sources, &cfg).await;
        assert_eq!(rows.len(), 2, "errors: {errors:?}");
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn glob_with_no_matches_reports_failure() {
        let (temp, blobs, cfg) = setup();
        let sources = vec![SourceSpec::Glob {
            pattern: format!("{}/*.nothing", temp.path().display()),
        }];
        let (rows, errors) = load_sources(blobs, "s1", &sources, &cfg).await;
        assert!(rows.is_empty());
        assert_eq!(errors[0].kind, "FileNotFound");
    }

    #[tokio::test]
    async fn many_sources_respect_concurrency_bound() {
        let (_t, blobs, mut cfg) = setup();
        cfg.max_concurrent_loads = 2;
        let sources: Vec<SourceSpec> = (0..20)
            .map(|i| inline(&format!("document number {i}")))
            .collect();
        let (rows, errors) = load_sources(blobs, "s1", &sources, &cfg).await;
        assert_eq!(rows.len(), 20);
        assert!(errors.is_empty());
    }
}

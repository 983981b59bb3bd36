//! Session runtime — the outer envelope of every tool call.
//!
//! The runtime owns the blob store, metadata store, index persistence
//! directory, configuration, session-lock map, and in-memory index cache;
//! one constructor returns the handle and tests build a fresh runtime
//! rooted at a temp directory.
//!
//! Every call runs the same protocol: authenticate the session, atomically
//! charge the budget (only the exact operation `session.create` is charged
//! after creation instead of before), take the session lock when the call
//! touches the index cache or the document set, dispatch, cap the response,
//! and append a trace.  Blocking SQLite and file work is dispatched with
//! `spawn_blocking` so the scheduling thread never blocks.

pub mod loader;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::index::persist::{IndexMeta, IndexStore, compute_fingerprint};
use crate::index::tokenizer::{self, Tokenizer};
use crate::index::{
    self, Bm25Index, INDEX_DOC_CHAR_CAP, best_window, ceil_char_boundary, floor_char_boundary,
    highlights_within,
};
use crate::store::blob::{self, BlobStore};
use crate::store::meta::{
    ArtifactRow, DocumentRow, MetaStore, STATUS_COMPLETED, SessionRow, SpanRow, TraceRow,
    now_iso8601,
};
use crate::tools::*;

const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_CONTEXT_CHARS: usize = 400;
const DEFAULT_LIST_LIMIT: u64 = 50;
const CHUNK_PREVIEW_CHARS: usize = 80;

pub struct Runtime {
    cfg: ServerConfig,
    tokenizer: Tokenizer,
    meta: Arc<MetaStore>,
    blobs: Arc<BlobStore>,
    indexes: Arc<IndexStore>,
    /// session id -> session lock.  The manager mutex guards only O(1)
    /// insertion and removal; the per-session locks are async and may be
    /// held across suspension points.
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// In-memory index cache, guarded by the session lock for all
    /// read-modify cycles; the inner mutex only protects the map itself.
    cache: StdMutex<HashMap<String, Arc<Bm25Index>>>,
}

impl Runtime {
    /// Build a runtime rooted at `cfg.data_dir`, creating the subtrees.
    pub fn new(cfg: ServerConfig) -> Result<Arc<Runtime>, EngineError> {
        let tokenizer = tokenizer::lookup(&cfg.tokenizer).ok_or_else(|| {
            EngineError::Config(format!("unknown tokenizer: '{}'", cfg.tokenizer))
        })?;

        std::fs::create_dir_all(&cfg.data_dir)?;
        let meta = Arc::new(MetaStore::open(&cfg.data_dir)?);
        let blobs = Arc::new(BlobStore::open(&cfg.data_dir.join("blobs"))?);
        let indexes = Arc::new(IndexStore::open(&cfg.data_dir.join("indexes"))?);

        info!(
            data_dir = %cfg.data_dir.display(),
            tokenizer = tokenizer.name(),
            "runtime ready"
        );

        Ok(Arc::new(Runtime {
            cfg,
            tokenizer,
            meta,
            blobs,
            indexes,
            locks: StdMutex::new(HashMap::new()),
            cache: StdMutex::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    // ── Envelope ──────────────────────────────────────────────────────────────

    /// Run one tool call through the full protocol and return its result
    /// value or a typed error.
    pub async fn dispatch(&self, tool: ToolName, params: Value) -> Result<Value, EngineError> {
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let input_summary = summarize_keys(&params);
        let session_hint = params
            .get("session_id")
            .and_then(Value::as_str)
            .map(String::from);

        let span = tracing::info_span!("tool_call", tool = tool.canonical(), %correlation_id);
        let result = self.dispatch_inner(tool, params).instrument(span).await;

        let (ok, output_summary) = match &result {
            Ok(v) => (true, summarize_keys(v)),
            Err(e) => (false, format!("error:{}", e.kind_tag())),
        };
        let session_id = session_hint.or_else(|| {
            result
                .as_ref()
                .ok()
                .and_then(|v| v.get("session_id"))
                .and_then(Value::as_str)
                .map(String::from)
        });

        // A trace-append failure is logged but never fails the operation.
        if let Some(session_id) = session_id {
            let trace = TraceRow {
                session_id,
                created_at: now_iso8601(),
                tool: tool.canonical().to_string(),
                input_summary,
                output_summary,
                duration_ms: started.elapsed().as_millis() as u64,
                ok,
                correlation_id,
            };
            let meta = Arc::clone(&self.meta);
            let appended = tokio::task::spawn_blocking(move || meta.append_trace(&trace)).await;
            match appended {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "trace append failed"),
                Err(e) => warn!(error = %e, "trace append task failed"),
            }
        }

        result
    }

    async fn dispatch_inner(&self, tool: ToolName, params: Value) -> Result<Value, EngineError> {
        // `session.create` is the one operation that may run without
        // pre-charging; it is charged once after the session row exists.
        if tool == ToolName::SessionCreate {
            return to_value(self.session_create(parse(params)?).await?);
        }

        let session_id = params
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidArgument("session_id is required".into()))?
            .to_string();

        let session = self.fetch_session(&session_id).await?;
        if session.status == STATUS_COMPLETED {
            // Once closed, no mutating operation succeeds; read-only
            // inspection and retrieval stay available.
            match tool {
                ToolName::SessionClose => {
                    return Err(EngineError::SessionAlreadyClosed(session_id));
                }
                ToolName::DocsLoad | ToolName::ChunkCreate | ToolName::ArtifactStore => {
                    return Err(EngineError::SessionClosed(session_id));
                }
                _ => {}
            }
        }

        self.charge(&session).await?;

        match tool {
            ToolName::SessionCreate => unreachable!("handled above"),
            ToolName::SessionInfo => {
                let _params: SessionInfoParams = parse(params)?;
                to_value(self.session_info(&session).await?)
            }
            ToolName::SessionClose => {
                let _params: SessionCloseParams = parse(params)?;
                to_value(self.session_close(&session).await?)
            }
            ToolName::DocsLoad => to_value(self.docs_load(&session, parse(params)?).await?),
            ToolName::DocsList => to_value(self.docs_list(&session, parse(params)?).await?),
            ToolName::DocsPeek => to_value(self.docs_peek(&session, parse(params)?).await?),
            ToolName::ChunkCreate => to_value(self.chunk_create(&session, parse(params)?).await?),
            ToolName::SpanGet => to_value(self.span_get(&session, parse(params)?).await?),
            ToolName::SearchQuery => to_value(self.search_query(&session, parse(params)?).await?),
            ToolName::ArtifactStore => {
                to_value(self.artifact_store(&session, parse(params)?).await?)
            }
            ToolName::ArtifactList => to_value(self.artifact_list(&session, parse(params)?).await?),
            ToolName::ArtifactGet => to_value(self.artifact_get(&session, parse(params)?).await?),
        }
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionRow, EngineError> {
        let meta = Arc::clone(&self.meta);
        let id = session_id.to_string();
        run_blocking(move || meta.get_session(&id))
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Atomic budget charge; a denial happens before any side effect.
    async fn charge(&self, session: &SessionRow) -> Result<u64, EngineError> {
        let meta = Arc::clone(&self.meta);
        let id = session.id.clone();
        run_blocking(move || meta.try_increment_tool_calls(&id))
            .await?
            .ok_or(EngineError::BudgetExceeded {
                used: session.config.max_tool_calls,
                limit: session.config.max_tool_calls,
            })
    }

    // ── Lock and cache management ─────────────────────────────────────────────

    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock manager mutex poisoned");
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn drop_session_lock(&self, session_id: &str) {
        self.locks
            .lock()
            .expect("lock manager mutex poisoned")
            .remove(session_id);
    }

    fn cache_get(&self, session_id: &str) -> Option<Arc<Bm25Index>> {
        self.cache
            .lock()
            .expect("index cache mutex poisoned")
            .get(session_id)
            .cloned()
    }

    fn cache_put(&self, session_id: &str, index: Arc<Bm25Index>) {
        self.cache
            .lock()
            .expect("index cache mutex poisoned")
            .insert(session_id.to_string(), index);
    }

    fn cache_remove(&self, session_id: &str) {
        self.cache
            .lock()
            .expect("index cache mutex poisoned")
            .remove(session_id);
    }

    // ── Index retrieval (three tiers, caller holds the session lock) ──────────

    async fn get_or_build_index(
        &self,
        session_id: &str,
    ) -> Result<(Arc<Bm25Index>, IndexSource), EngineError> {
        if let Some(index) = self.cache_get(session_id) {
            return Ok((index, IndexSource::Memory));
        }

        let (doc_count, pairs) = {
            let meta = Arc::clone(&self.meta);
            let id = session_id.to_string();
            run_blocking(move || {
                let count = meta.count_documents(&id)?;
                let pairs = meta.document_fingerprints(&id)?;
                Ok::<_, EngineError>((count, pairs))
            })
            .await?
        };
        let fingerprint = compute_fingerprint(&pairs);

        let snapshot = {
            let indexes = Arc::clone(&self.indexes);
            let id = session_id.to_string();
            run_blocking(move || indexes.load(&id)).await?
        };
        if let Some((index, meta)) = snapshot {
            if meta.is_fresh(doc_count, self.tokenizer.name(), &fingerprint) {
                let index = Arc::new(index);
                self.cache_put(session_id, Arc::clone(&index));
                debug!(session_id, "index loaded from disk snapshot");
                return Ok((index, IndexSource::Disk));
            }
            warn!(session_id, "stale index snapshot, rebuilding");
            let indexes = Arc::clone(&self.indexes);
            let id = session_id.to_string();
            run_blocking(move || indexes.invalidate(&id)).await?;
        }

        let index = Arc::new(self.build_index(session_id).await?);
        self.cache_put(session_id, Arc::clone(&index));
        Ok((index, IndexSource::Built))
    }

    async fn build_index(&self, session_id: &str) -> Result<Bm25Index, EngineError> {
        let docs = {
            let meta = Arc::clone(&self.meta);
            let id = session_id.to_string();
            run_blocking(move || meta.all_documents(&id)).await?
        };

        let mut corpus: Vec<(String, String)> = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(text) = self.read_document_text(&doc).await? else {
                warn!(doc_id = %doc.id, name = %doc.name, "blob unreachable, skipping document in index");
                continue;
            };
            let text = if text.len() > INDEX_DOC_CHAR_CAP {
                warn!(
                    doc_id = %doc.id,
                    name = %doc.name,
                    cap = INDEX_DOC_CHAR_CAP,
                    "document truncated into index at character cap"
                );
                text[..floor_char_boundary(&text, INDEX_DOC_CHAR_CAP)].to_string()
            } else {
                text
            };
            corpus.push((doc.id, text));
        }

        let tokenizer = self.tokenizer;
        let index = run_blocking(move || Ok::<_, EngineError>(Bm25Index::build(&corpus, tokenizer)))
            .await?;
        debug!(session_id, docs = index.doc_count(), "index built");
        Ok(index)
    }

    async fn read_document_text(&self, doc: &DocumentRow) -> Result<Option<String>, EngineError> {
        let blobs = Arc::clone(&self.blobs);
        let hash = doc.content_hash.clone();
        let bytes = run_blocking(move || blobs.get(&hash)).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    // ── session.* ─────────────────────────────────────────────────────────────

    async fn session_create(
        &self,
        params: SessionCreateParams,
    ) -> Result<SessionCreateResult, EngineError> {
        let config = self.cfg.session_config(params.config);
        let name = params.name.unwrap_or_else(|| "session".to_string());

        let meta = Arc::clone(&self.meta);
        let row = {
            let config = config.clone();
            run_blocking(move || meta.create_session(&name, &config)).await?
        };

        // Charged exactly once, after creation.
        self.charge(&row).await?;
        info!(session_id = %row.id, name = %row.name, "session created");

        Ok(SessionCreateResult {
            session_id: row.id,
            name: row.name,
            config,
            created_at: row.created_at,
        })
    }

    async fn session_info(&self, session: &SessionRow) -> Result<SessionInfoResult, EngineError> {
        let meta = Arc::clone(&self.meta);
        let id = session.id.clone();
        let (docs, spans, artifacts, row) = run_blocking(move || {
            let docs = meta.count_documents(&id)?;
            let spans = meta.count_spans(&id)?;
            let artifacts = meta.count_artifacts(&id)?;
            let row = meta
                .get_session(&id)?
                .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?;
            Ok::<_, EngineError>((docs, spans, artifacts, row))
        })
        .await?;

        Ok(SessionInfoResult {
            session_id: row.id,
            name: row.name,
            status: row.status,
            document_count: docs,
            span_count: spans,
            artifact_count: artifacts,
            tool_calls_used: row.tool_calls_used,
            tool_calls_remaining: row.config.max_tool_calls.saturating_sub(row.tool_calls_used),
        })
    }

    async fn session_close(&self, session: &SessionRow) -> Result<SessionCloseResult, EngineError> {
        let lock = self.session_lock(&session.id);
        let guard = lock.lock().await;

        // Persist the cached index before flipping status, so an interrupted
        // close never leaves a closed session with a half-written snapshot.
        if let Some(index) = self.cache_get(&session.id) {
            let meta = Arc::clone(&self.meta);
            let indexes = Arc::clone(&self.indexes);
            let id = session.id.clone();
            let tokenizer_name = self.tokenizer.name().to_string();
            run_blocking(move || {
                let count = meta.count_documents(&id)?;
                let pairs = meta.document_fingerprints(&id)?;
                let snapshot_meta =
                    IndexMeta::new(count, &tokenizer_name, compute_fingerprint(&pairs));
                indexes.save(&id, &index, &snapshot_meta)
            })
            .await?;
            debug!(session_id = %session.id, "index snapshot persisted on close");
        }

        let closed = {
            let meta = Arc::clone(&self.meta);
            let id = session.id.clone();
            run_blocking(move || meta.close_session(&id)).await?
        };
        if !closed {
            return Err(EngineError::SessionAlreadyClosed(session.id.clone()));
        }

        self.cache_remove(&session.id);
        drop(guard);
        self.drop_session_lock(&session.id);

        let meta = Arc::clone(&self.meta);
        let id = session.id.clone();
        let (docs, spans, artifacts, used) = run_blocking(move || {
            let docs = meta.count_documents(&id)?;
            let spans = meta.count_spans(&id)?;
            let artifacts = meta.count_artifacts(&id)?;
            let used = meta
                .get_session(&id)?
                .map(|s| s.tool_calls_used)
                .unwrap_or_default();
            Ok::<_, EngineError>((docs, spans, artifacts, used))
        })
        .await?;

        info!(session_id = %session.id, "session closed");
        Ok(SessionCloseResult {
            session_id: session.id.clone(),
            status: STATUS_COMPLETED.to_string(),
            document_count: docs,
            span_count: spans,
            artifact_count: artifacts,
            tool_calls_used: used,
        })
    }

    // ── docs.* ────────────────────────────────────────────────────────────────

    async fn docs_load(
        &self,
        session: &SessionRow,
        params: DocsLoadParams,
    ) -> Result<DocsLoadResult, EngineError> {
        if params.sources.is_empty() {
            return Err(EngineError::InvalidArgument(
                "sources must not be empty".into(),
            ));
        }

        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;

        let (rows, errors) = loader::load_sources(
            Arc::clone(&self.blobs),
            &session.id,
            &params.sources,
            &self.cfg.loader,
        )
        .await;

        let loaded: Vec<LoadedDoc> = rows
            .iter()
            .map(|row| LoadedDoc {
                doc_id: row.id.clone(),
                name: row.name.clone(),
                content_hash: row.content_hash.clone(),
                length_chars: row.length_chars,
                token_estimate: row.length_chars / 4,
            })
            .collect();

        if !rows.is_empty() {
            {
                let meta = Arc::clone(&self.meta);
                run_blocking(move || meta.create_documents_batch(&rows)).await?;
            }
            // Invalidation must be visible before the commit is acknowledged.
            self.cache_remove(&session.id);
            let indexes = Arc::clone(&self.indexes);
            let id = session.id.clone();
            run_blocking(move || indexes.invalidate(&id)).await?;
        }

        info!(
            session_id = %session.id,
            loaded = loaded.len(),
            errors = errors.len(),
            "documents loaded"
        );
        Ok(DocsLoadResult { loaded, errors })
    }

    async fn docs_list(
        &self,
        session: &SessionRow,
        params: DocsListParams,
    ) -> Result<DocsListResult, EngineError> {
        let page = params.page.unwrap_or(1).max(1);
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);

        let meta = Arc::clone(&self.meta);
        let id = session.id.clone();
        let (rows, total) = run_blocking(move || {
            let rows = meta.list_documents(&id, (page - 1) * limit, limit)?;
            let total = meta.count_documents(&id)?;
            Ok::<_, EngineError>((rows, total))
        })
        .await?;

        let mut budget = CharBudget::new(session.config.max_chars_per_response);
        let mut documents = Vec::new();
        let mut truncated = false;
        for row in rows {
            let record = DocRecord {
                doc_id: row.id,
                name: row.name,
                content_hash: row.content_hash,
                source_kind: row.source_kind,
                source_path: row.source_path,
                length_chars: row.length_chars,
                created_at: row.created_at,
            };
            if !budget.admit_record(&record)? {
                truncated = true;
                break;
            }
            documents.push(record);
        }

        Ok(DocsListResult {
            documents,
            total,
            page,
            truncated,
        })
    }

    async fn docs_peek(
        &self,
        session: &SessionRow,
        params: DocsPeekParams,
    ) -> Result<DocsPeekResult, EngineError> {
        let doc = self.fetch_document(&session.id, &params.doc_id).await?;

        let start = params.start.unwrap_or(0);
        let end = params.end.unwrap_or(doc.length_chars).min(doc.length_chars);
        if start > end || (start > 0 && start >= doc.length_chars) {
            return Err(EngineError::InvalidArgument(format!(
                "range [{start}, {}) is out of bounds for document '{}' of length {}",
                params.end.unwrap_or(doc.length_chars),
                doc.name,
                doc.length_chars
            )));
        }

        let bytes = {
            let blobs = Arc::clone(&self.blobs);
            let hash = doc.content_hash.clone();
            let (s, e) = (start as usize, end as usize);
            run_blocking(move || blobs.get_slice(&hash, s, e)).await?
        }
        .ok_or_else(|| EngineError::BlobMissing(format!("document '{}' ({})", doc.name, doc.content_hash)))?;

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let peek_cap = session
            .config
            .max_chars_per_peek
            .min(session.config.max_chars_per_response);
        let mut budget = CharBudget::new(peek_cap);
        let (content, truncated) = budget.take(&text);

        Ok(DocsPeekResult {
            span: SpanRef {
                doc_id: doc.id,
                start,
                end: start + content.len() as u64,
            },
            content,
            content_hash: doc.content_hash,
            truncated,
            length_chars: doc.length_chars,
        })
    }

    async fn fetch_document(
        &self,
        session_id: &str,
        doc_id: &str,
    ) -> Result<DocumentRow, EngineError> {
        let meta = Arc::clone(&self.meta);
        let (sid, did) = (session_id.to_string(), doc_id.to_string());
        run_blocking(move || meta.get_document(&sid, &did))
            .await?
            .ok_or_else(|| {
                EngineError::DocumentNotFound(format!("{doc_id} in session {session_id}"))
            })
    }

    // ── chunk.* / span.* ──────────────────────────────────────────────────────

    async fn chunk_create(
        &self,
        session: &SessionRow,
        params: ChunkCreateParams,
    ) -> Result<ChunkCreateResult, EngineError> {
        params.strategy.validate()?;
        let doc = self.fetch_document(&session.id, &params.doc_id).await?;

        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;

        let text = self.read_document_text(&doc).await?.ok_or_else(|| {
            EngineError::BlobMissing(format!("document '{}' ({})", doc.name, doc.content_hash))
        })?;
        let bytes = text.as_bytes();

        let descriptor = params.strategy.descriptor();
        let fingerprint = params.strategy.fingerprint();
        let ranges = params.strategy.plan(bytes, params.max_chunks)?;

        // Identical requests may reuse the spans persisted last time.
        if session.config.chunk_cache_enabled {
            let existing = {
                let meta = Arc::clone(&self.meta);
                let (sid, did) = (session.id.clone(), doc.id.clone());
                run_blocking(move || meta.list_spans_by_document(&sid, &did)).await?
            };
            let cached: Vec<SpanRow> = existing
                .into_iter()
                .filter(|s| s.strategy == descriptor)
                .collect();
            if cached.len() == ranges.len() && !cached.is_empty() {
                debug!(doc_id = %doc.id, "chunk request served from existing spans");
                return self.chunk_result(session, &doc, &text, cached);
            }
        }

        let created_at = now_iso8601();
        let spans: Vec<SpanRow> = ranges
            .iter()
            .enumerate()
            .map(|(idx, range)| SpanRow {
                id: chunk_span_id(&doc.id, &fingerprint, idx as u32),
                session_id: session.id.clone(),
                doc_id: doc.id.clone(),
                start: range.start as u64,
                end: range.end as u64,
                content_hash: blob::content_hash(&bytes[range.clone()]),
                strategy: descriptor.clone(),
                chunk_index: Some(idx as u32),
                created_at: created_at.clone(),
            })
            .collect();

        {
            let meta = Arc::clone(&self.meta);
            let spans = spans.clone();
            run_blocking(move || meta.create_spans_batch(&spans)).await?;
        }
        info!(session_id = %session.id, doc_id = %doc.id, chunks = spans.len(), "chunks created");
        self.chunk_result(session, &doc, &text, spans)
    }

    fn chunk_result(
        &self,
        session: &SessionRow,
        doc: &DocumentRow,
        text: &str,
        spans: Vec<SpanRow>,
    ) -> Result<ChunkCreateResult, EngineError> {
        let mut budget = CharBudget::new(session.config.max_chars_per_response);
        let mut infos = Vec::with_capacity(spans.len());
        let mut truncated = false;

        for span in spans {
            let start = span.start as usize;
            let end = (span.end as usize).min(text.len());
            let slice = &text[floor_char_boundary(text, start)..floor_char_boundary(text, end)];
            let preview_end = ceil_char_boundary(slice, CHUNK_PREVIEW_CHARS.min(slice.len()));
            let (preview, clipped) = budget.take(&slice[..preview_end]);
            truncated |= clipped;

            infos.push(ChunkInfo {
                span_id: span.id,
                chunk_index: span.chunk_index.unwrap_or_default(),
                start: span.start,
                end: span.end,
                content_hash: span.content_hash,
                preview,
            });
        }

        Ok(ChunkCreateResult {
            doc_id: doc.id.clone(),
            spans: infos,
            truncated,
        })
    }

    async fn span_get(
        &self,
        session: &SessionRow,
        params: SpanGetParams,
    ) -> Result<SpanGetResult, EngineError> {
        if params.span_ids.is_empty() {
            return Err(EngineError::InvalidArgument(
                "span_ids must not be empty".into(),
            ));
        }

        let mut budget = CharBudget::new(session.config.max_chars_per_response);
        let mut spans = Vec::with_capacity(params.span_ids.len());
        let mut truncated = false;

        for span_id in &params.span_ids {
            let row = {
                let meta = Arc::clone(&self.meta);
                let (sid, id) = (session.id.clone(), span_id.clone());
                run_blocking(move || meta.get_span(&sid, &id)).await?
            };
            let Some(row) = row else {
                return Err(self.span_not_found(session, span_id).await);
            };

            let doc = self.fetch_document(&session.id, &row.doc_id).await?;
            let bytes = {
                let blobs = Arc::clone(&self.blobs);
                let hash = doc.content_hash.clone();
                let (s, e) = (row.start as usize, row.end as usize);
                run_blocking(move || blobs.get_slice(&hash, s, e)).await?
            }
            .ok_or_else(|| {
                EngineError::BlobMissing(format!("document '{}' ({})", doc.name, doc.content_hash))
            })?;

            let text = String::from_utf8_lossy(&bytes).into_owned();
            let (content, clipped) = budget.take(&text);
            truncated |= clipped;

            spans.push(SpanContent {
                span_id: row.id.clone(),
                span: SpanRef {
                    doc_id: row.doc_id,
                    start: row.start,
                    end: row.end,
                },
                content,
                content_hash: row.content_hash,
                truncated: clipped,
            });
        }

        Ok(SpanGetResult { spans, truncated })
    }

    /// Build the missing-span error.  A structured chunk id still names its
    /// document and `chunk_index` even when the row is gone.
    async fn span_not_found(&self, session: &SessionRow, span_id: &str) -> EngineError {
        if let Some((doc_id, chunk_index)) = parse_chunk_span_id(span_id) {
            let meta = Arc::clone(&self.meta);
            let (sid, did) = (session.id.clone(), doc_id);
            let doc = run_blocking(move || meta.get_document(&sid, &did))
                .await
                .ok()
                .flatten();
            if let Some(doc) = doc {
                return EngineError::SpanNotFound(format!(
                    "span {span_id} not found in session {}: document '{}' has no stored span at chunk_index {chunk_index}",
                    session.id, doc.name
                ));
            }
        }
        EngineError::SpanNotFound(format!(
            "span {span_id} not found in session {}; chunk span ids follow ck_<doc>_<strategy>_<index>",
            session.id
        ))
    }

    // ── search.* ──────────────────────────────────────────────────────────────

    async fn search_query(
        &self,
        session: &SessionRow,
        params: SearchQueryParams,
    ) -> Result<SearchQueryResult, EngineError> {
        let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1);
        let context_chars = params.context_chars.unwrap_or(DEFAULT_CONTEXT_CHARS).max(1);
        let filter: Option<HashSet<String>> =
            params.doc_ids.as_ref().map(|ids| ids.iter().cloned().collect());

        match params.method {
            SearchMethod::Bm25 => {
                self.search_bm25(session, &params.query, limit, context_chars, filter)
                    .await
            }
            SearchMethod::Regex | SearchMethod::Literal => {
                self.search_scan(session, &params, limit, context_chars, filter)
                    .await
            }
        }
    }

    async fn search_bm25(
        &self,
        session: &SessionRow,
        query: &str,
        limit: usize,
        context_chars: usize,
        filter: Option<HashSet<String>>,
    ) -> Result<SearchQueryResult, EngineError> {
        let (index, source) = {
            let lock = self.session_lock(&session.id);
            let _guard = lock.lock().await;
            self.get_or_build_index(&session.id).await?
        };

        let ranked = index.query(query, limit, filter.as_ref(), self.tokenizer);

        let mut budget = CharBudget::new(session.config.max_chars_per_response);
        let mut matches = Vec::with_capacity(ranked.len());
        let mut truncated = false;

        for hit in ranked {
            if budget.exhausted() {
                truncated = true;
                break;
            }
            let doc = self.fetch_document(&session.id, &hit.doc_id).await?;
            let Some(text) = self.read_document_text(&doc).await? else {
                warn!(doc_id = %doc.id, "blob unreachable, skipping search match");
                continue;
            };

            let window = best_window(&text, &hit.terms, context_chars, self.tokenizer);
            let (context, clipped) = budget.take(&text[window.clone()]);
            truncated |= clipped;
            let clipped_window = window.start..window.start + context.len();
            let highlights =
                highlights_within(&text, &clipped_window, &hit.terms, self.tokenizer);

            matches.push(SearchMatch {
                doc_id: doc.id,
                doc_name: doc.name,
                span: SpanRef {
                    doc_id: hit.doc_id,
                    start: clipped_window.start as u64,
                    end: clipped_window.end as u64,
                },
                score: hit.score,
                context,
                highlights,
            });
        }

        Ok(SearchQueryResult {
            matches,
            method: SearchMethod::Bm25,
            index_source: Some(source),
            truncated,
        })
    }

    /// Regex and literal methods share the result shape but never build or
    /// consult the BM25 index.
    async fn search_scan(
        &self,
        session: &SessionRow,
        params: &SearchQueryParams,
        limit: usize,
        context_chars: usize,
        filter: Option<HashSet<String>>,
    ) -> Result<SearchQueryResult, EngineError> {
        if params.query.is_empty() {
            return Err(EngineError::InvalidArgument("query must not be empty".into()));
        }
        let matcher = match params.method {
            SearchMethod::Regex => Matcher::Regex(regex::Regex::new(&params.query).map_err(
                |e| EngineError::InvalidArgument(format!("invalid regex: {e}")),
            )?),
            SearchMethod::Literal => Matcher::Literal(params.query.clone()),
            SearchMethod::Bm25 => unreachable!("scan methods only"),
        };

        let docs = {
            let meta = Arc::clone(&self.meta);
            let id = session.id.clone();
            run_blocking(move || meta.all_documents(&id)).await?
        };

        let mut scored: Vec<(DocumentRow, String, Vec<(usize, usize)>)> = Vec::new();
        for doc in docs {
            if filter.as_ref().is_some_and(|f| !f.contains(&doc.id)) {
                continue;
            }
            let Some(text) = self.read_document_text(&doc).await? else {
                warn!(doc_id = %doc.id, "blob unreachable, skipping search match");
                continue;
            };
            let occurrences = matcher.find_all(&text);
            if !occurrences.is_empty() {
                scored.push((doc, text, occurrences));
            }
        }
        scored.sort_by(|a, b| b.2.len().cmp(&a.2.len()).then_with(|| a.0.id.cmp(&b.0.id)));
        scored.truncate(limit);

        let mut budget = CharBudget::new(session.config.max_chars_per_response);
        let mut matches = Vec::new();
        let mut truncated = false;

        for (doc, text, occurrences) in scored {
            if budget.exhausted() {
                truncated = true;
                break;
            }
            let (first_start, first_end) = occurrences[0];
            let window = window_around(&text, first_start, first_end, context_chars);
            let (context, clipped) = budget.take(&text[window.clone()]);
            truncated |= clipped;
            let clipped_window = window.start..window.start + context.len();

            let highlights = index::match_highlights(&text, &occurrences, &clipped_window);

            matches.push(SearchMatch {
                doc_id: doc.id.clone(),
                doc_name: doc.name,
                span: SpanRef {
                    doc_id: doc.id,
                    start: clipped_window.start as u64,
                    end: clipped_window.end as u64,
                },
                score: occurrences.len() as f32,
                context,
                highlights,
            });
        }

        Ok(SearchQueryResult {
            matches,
            method: params.method,
            index_source: None,
            truncated,
        })
    }

    // ── artifact.* ────────────────────────────────────────────────────────────

    async fn artifact_store(
        &self,
        session: &SessionRow,
        params: ArtifactStoreParams,
    ) -> Result<ArtifactStoreResult, EngineError> {
        let span_id = match (params.span_id, params.span) {
            (Some(_), Some(_)) => {
                return Err(EngineError::InvalidArgument(
                    "span_id and span are mutually exclusive".into(),
                ));
            }
            (Some(span_id), None) => {
                // Referenced span must live in this session.
                let exists = {
                    let meta = Arc::clone(&self.meta);
                    let (sid, id) = (session.id.clone(), span_id.clone());
                    run_blocking(move || meta.get_span(&sid, &id)).await?
                };
                if exists.is_none() {
                    return Err(self.span_not_found(session, &span_id).await);
                }
                Some(span_id)
            }
            (None, Some(inline)) => Some(self.create_inline_span(session, inline).await?),
            (None, None) => None,
        };

        let mut provenance = params.provenance;
        if let Some(p) = &mut provenance {
            p.created_at.get_or_insert_with(now_iso8601);
        }

        let provenance = provenance
            .map(|p| to_value(p))
            .transpose()?;
        let artifact = ArtifactRow {
            id: uuid::Uuid::now_v7().to_string(),
            session_id: session.id.clone(),
            span_id: span_id.clone(),
            artifact_type: params.artifact_type,
            content: params.content,
            provenance,
            created_at: now_iso8601(),
        };

        {
            let meta = Arc::clone(&self.meta);
            let artifact = artifact.clone();
            run_blocking(move || meta.create_artifact(&artifact)).await?;
        }
        debug!(session_id = %session.id, artifact_id = %artifact.id, "artifact stored");

        Ok(ArtifactStoreResult {
            artifact_id: artifact.id,
            span_id,
        })
    }

    async fn create_inline_span(
        &self,
        session: &SessionRow,
        inline: InlineSpan,
    ) -> Result<String, EngineError> {
        let doc = self.fetch_document(&session.id, &inline.doc_id).await?;
        if inline.start >= inline.end || inline.end > doc.length_chars {
            return Err(EngineError::InvalidArgument(format!(
                "span [{}, {}) is out of bounds for document '{}' of length {}",
                inline.start, inline.end, doc.name, doc.length_chars
            )));
        }

        let bytes = {
            let blobs = Arc::clone(&self.blobs);
            let hash = doc.content_hash.clone();
            let (s, e) = (inline.start as usize, inline.end as usize);
            run_blocking(move || blobs.get_slice(&hash, s, e)).await?
        }
        .ok_or_else(|| {
            EngineError::BlobMissing(format!("document '{}' ({})", doc.name, doc.content_hash))
        })?;

        let span = SpanRow {
            id: format!("sp_{}", uuid::Uuid::now_v7().simple()),
            session_id: session.id.clone(),
            doc_id: doc.id,
            start: inline.start,
            end: inline.end,
            content_hash: blob::content_hash(&bytes),
            strategy: "inline".to_string(),
            chunk_index: None,
            created_at: now_iso8601(),
        };
        let span_id = span.id.clone();

        let meta = Arc::clone(&self.meta);
        run_blocking(move || meta.create_spans_batch(&[span])).await?;
        Ok(span_id)
    }

    async fn artifact_list(
        &self,
        session: &SessionRow,
        params: ArtifactListParams,
    ) -> Result<ArtifactListResult, EngineError> {
        let rows = {
            let meta = Arc::clone(&self.meta);
            let id = session.id.clone();
            run_blocking(move || {
                meta.list_artifacts(&id, params.span_id.as_deref(), params.artifact_type.as_deref())
            })
            .await?
        };

        let mut budget = CharBudget::new(session.config.max_chars_per_response);
        let mut artifacts = Vec::new();
        let mut truncated = false;
        for row in rows {
            let record = artifact_record(row);
            if !budget.admit_record(&record)? {
                truncated = true;
                break;
            }
            artifacts.push(record);
        }

        Ok(ArtifactListResult { artifacts, truncated })
    }

    async fn artifact_get(
        &self,
        session: &SessionRow,
        params: ArtifactGetParams,
    ) -> Result<ArtifactRecord, EngineError> {
        let row = {
            let meta = Arc::clone(&self.meta);
            let (sid, id) = (session.id.clone(), params.artifact_id.clone());
            run_blocking(move || meta.get_artifact(&sid, &id)).await?
        }
        .ok_or_else(|| {
            EngineError::ArtifactNotFound(format!(
                "{} in session {}",
                params.artifact_id, session.id
            ))
        })?;
        Ok(artifact_record(row))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Deterministic id for a chunk-produced span.  The structure is what lets a
/// missing-span error still name the owning document and chunk index.
fn chunk_span_id(doc_id: &str, strategy_fingerprint: &str, index: u32) -> String {
    format!("ck_{doc_id}_{strategy_fingerprint}_{index:04}")
}

/// Parse a chunk span id back into `(doc_id, chunk_index)`.
fn parse_chunk_span_id(span_id: &str) -> Option<(String, u32)> {
    let rest = span_id.strip_prefix("ck_")?;
    let (rest, index) = rest.rsplit_once('_')?;
    let (doc_id, _fingerprint) = rest.rsplit_once('_')?;
    let index: u32 = index.parse().ok()?;
    if doc_id.is_empty() {
        return None;
    }
    Some((doc_id.to_string(), index))
}

/// Window of `context_chars` bytes centered on a match, snapped to char
/// boundaries.
fn window_around(
    text: &str,
    match_start: usize,
    match_end: usize,
    context_chars: usize,
) -> std::ops::Range<usize> {
    let match_len = match_end.saturating_sub(match_start);
    let slack = context_chars.saturating_sub(match_len);
    let start = match_start.saturating_sub(slack / 2);
    let end = (start + context_chars).min(text.len());
    let start = start.min(end);
    floor_char_boundary(text, start)..ceil_char_boundary(text, end)
}

enum Matcher {
    Regex(regex::Regex),
    Literal(String),
}

impl Matcher {
    fn find_all(&self, text: &str) -> Vec<(usize, usize)> {
        match self {
            Matcher::Regex(re) => re.find_iter(text).map(|m| (m.start(), m.end())).collect(),
            Matcher::Literal(q) => text
                .match_indices(q.as_str())
                .map(|(i, _)| (i, i + q.len()))
                .collect(),
        }
    }
}

fn artifact_record(row: ArtifactRow) -> ArtifactRecord {
    ArtifactRecord {
        artifact_id: row.id,
        span_id: row.span_id,
        artifact_type: row.artifact_type,
        content: row.content,
        provenance: row.provenance,
        created_at: row.created_at,
    }
}

/// Cumulative response budget over user-visible content bytes.
struct CharBudget {
    remaining: usize,
}

impl CharBudget {
    fn new(limit: usize) -> Self {
        CharBudget { remaining: limit }
    }

    fn exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Consume up to the remaining budget of `s`; the bool reports whether
    /// the cap forced truncation.
    fn take(&mut self, s: &str) -> (String, bool) {
        if s.len() <= self.remaining {
            self.remaining -= s.len();
            (s.to_string(), false)
        } else {
            let cut = floor_char_boundary(s, self.remaining);
            self.remaining = 0;
            (s[..cut].to_string(), true)
        }
    }

    /// Charge a whole serialized record against the budget; `false` means
    /// the record does not fit and the list is truncated here.
    fn admit_record<T: serde::Serialize>(&mut self, record: &T) -> Result<bool, EngineError> {
        let size = serde_json::to_string(record)
            .map_err(|e| EngineError::Meta(format!("serialize record: {e}")))?
            .len();
        if size > self.remaining {
            self.remaining = 0;
            return Ok(false);
        }
        self.remaining -= size;
        Ok(true)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Meta(format!("blocking task join: {e}")))?
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, EngineError> {
    // Absent params arrive as null; treat them as an empty object so
    // all-optional shapes parse.
    let params = match params {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    serde_json::from_value(params)
        .map_err(|e| EngineError::InvalidArgument(format!("malformed params: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Meta(format!("serialize result: {e}")))
}

/// Key-only summary of a request or response object — trace entries never
/// carry full bytes.
fn summarize_keys(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            format!("keys=[{}]", keys.join(","))
        }
        Value::Null => "null".to_string(),
        other => format!("{}", value_type(other)),
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

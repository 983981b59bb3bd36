//! Durable metadata store — sessions, documents, spans, artifacts, traces.
//!
//! A single SQLite file under the data dir.  Connections are opened per
//! operation with WAL + foreign-keys + busy-timeout pragmas; SQLite provides
//! the serialization, and the one operation that must be atomic (the budget
//! increment) is a single `UPDATE ... RETURNING` statement.
//!
//! Schema evolution is by forward-only numbered migrations replayed on open;
//! each migration advances `PRAGMA user_version` by one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::config::SessionConfig;
use crate::error::EngineError;

pub const DB_FILENAME: &str = "metadata.db";

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_COMPLETED: &str = "completed";

/// Upper bound on a single `list_traces` page.
pub const TRACE_LIST_CAP: u64 = 500;

/// Forward-only migrations; index `n` takes the schema from version `n` to
/// `n + 1`.
const MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE sessions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        closed_at TEXT,
        config TEXT NOT NULL,
        tool_calls_used INTEGER NOT NULL DEFAULT 0,
        max_tool_calls INTEGER NOT NULL
    );

    CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        content_hash TEXT NOT NULL,
        source_kind TEXT NOT NULL,
        source_path TEXT,
        name TEXT NOT NULL,
        length_chars INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        metadata TEXT NOT NULL
    );
    CREATE INDEX idx_documents_session ON documents(session_id, id);

    CREATE TABLE spans (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        doc_id TEXT NOT NULL REFERENCES documents(id),
        start_byte INTEGER NOT NULL,
        end_byte INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        strategy TEXT NOT NULL,
        chunk_index INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_spans_doc ON spans(doc_id, chunk_index);

    CREATE TABLE artifacts (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        span_id TEXT REFERENCES spans(id),
        artifact_type TEXT NOT NULL,
        content TEXT NOT NULL,
        provenance TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_artifacts_session ON artifacts(session_id, created_at);

    CREATE TABLE traces (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        tool TEXT NOT NULL,
        input_summary TEXT NOT NULL,
        output_summary TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        ok INTEGER NOT NULL,
        correlation_id TEXT NOT NULL
    );
    CREATE INDEX idx_traces_session ON traces(session_id, seq);
    ",
];

// ── Row types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
    pub closed_at: Option<String>,
    pub config: SessionConfig,
    pub tool_calls_used: u64,
}

#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: String,
    pub session_id: String,
    pub content_hash: String,
    /// `inline` or `file`.
    pub source_kind: String,
    pub source_path: Option<String>,
    pub name: String,
    pub length_chars: u64,
    pub created_at: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SpanRow {
    pub id: String,
    pub session_id: String,
    pub doc_id: String,
    pub start: u64,
    pub end: u64,
    pub content_hash: String,
    /// Strategy descriptor that produced the span (`inline` for ad-hoc spans).
    pub strategy: String,
    pub chunk_index: Option<u32>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub id: String,
    pub session_id: String,
    pub span_id: Option<String>,
    pub artifact_type: String,
    pub content: serde_json::Value,
    pub provenance: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct TraceRow {
    pub session_id: String,
    pub created_at: String,
    pub tool: String,
    pub input_summary: String,
    pub output_summary: String,
    pub duration_ms: u64,
    pub ok: bool,
    pub correlation_id: String,
}

/// Current UTC time as an RFC 3339 string with second precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MetaStore {
    db_path: PathBuf,
}

impl MetaStore {
    /// Open (creating if needed) the metadata store in `dir` and replay any
    /// pending migrations.
    pub fn open(dir: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::Meta(format!("meta: cannot create {}: {e}", dir.display())))?;
        let store = Self {
            db_path: dir.join(DB_FILENAME),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&self) -> Result<(), EngineError> {
        let conn = self.open_conn()?;
        let mut version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(|e| EngineError::Meta(format!("meta: read schema version: {e}")))?;

        if version as usize > MIGRATIONS.len() {
            return Err(EngineError::Meta(format!(
                "meta: database schema version {version} is newer than this build supports ({})",
                MIGRATIONS.len()
            )));
        }

        while (version as usize) < MIGRATIONS.len() {
            let step = MIGRATIONS[version as usize];
            conn.execute_batch(step)
                .map_err(|e| EngineError::Meta(format!("meta: migration {version}: {e}")))?;
            version += 1;
            conn.pragma_update(None, "user_version", version)
                .map_err(|e| EngineError::Meta(format!("meta: advance schema version: {e}")))?;
        }
        Ok(())
    }

    fn open_conn(&self) -> Result<Connection, EngineError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| EngineError::Meta(format!("meta: open {}: {e}", self.db_path.display())))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EngineError::Meta(format!("meta: set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| EngineError::Meta(format!("meta: set foreign_keys ON: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| EngineError::Meta(format!("meta: set busy_timeout: {e}")))?;

        Ok(conn)
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn create_session(&self, name: &str, config: &SessionConfig) -> Result<SessionRow, EngineError> {
        let conn = self.open_conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_iso8601();
        let config_json = serde_json::to_string(config)
            .map_err(|e| EngineError::Meta(format!("meta: serialize session config: {e}")))?;

        conn.execute(
            "INSERT INTO sessions (id, name, status, created_at, closed_at, config, tool_calls_used, max_tool_calls)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, 0, ?6)",
            params![id, name, STATUS_ACTIVE, created_at, config_json, config.max_tool_calls],
        )
        .map_err(|e| EngineError::Meta(format!("meta: insert session: {e}")))?;

        Ok(SessionRow {
            id,
            name: name.to_string(),
            status: STATUS_ACTIVE.to_string(),
            created_at,
            closed_at: None,
            config: config.clone(),
            tool_calls_used: 0,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, EngineError> {
        let conn = self.open_conn()?;
        conn.query_row(
            "SELECT id, name, status, created_at, closed_at, config, tool_calls_used
             FROM sessions WHERE id = ?1",
            params![session_id],
            |row| {
                let config_json: String = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    config_json,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()
        .map_err(|e| EngineError::Meta(format!("meta: get session {session_id}: {e}")))?
        .map(|(id, name, status, created_at, closed_at, config_json, used)| {
            let config: SessionConfig = serde_json::from_str(&config_json)
                .map_err(|e| EngineError::Meta(format!("meta: decode session config: {e}")))?;
            Ok(SessionRow {
                id,
                name,
                status,
                created_at,
                closed_at,
                config,
                tool_calls_used: used as u64,
            })
        })
        .transpose()
    }

    /// Transition `active -> completed`.  Returns `false` when the session
    /// was not active (already completed).
    pub fn close_session(&self, session_id: &str) -> Result<bool, EngineError> {
        let conn = self.open_conn()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET status = ?2, closed_at = ?3 WHERE id = ?1 AND status = ?4",
                params![session_id, STATUS_COMPLETED, now_iso8601(), STATUS_ACTIVE],
            )
            .map_err(|e| EngineError::Meta(format!("meta: close session {session_id}: {e}")))?;
        Ok(changed == 1)
    }

    /// The atomic primitive of the budget system: increment
    /// `tool_calls_used` by exactly one, observing `max_tool_calls`, in a
    /// single statement.  Returns the new count, or `None` when the cap
    /// would be exceeded (no increment happens).
    pub fn try_increment_tool_calls(&self, session_id: &str) -> Result<Option<u64>, EngineError> {
        let conn = self.open_conn()?;
        conn.query_row(
            "UPDATE sessions SET tool_calls_used = tool_calls_used + 1
             WHERE id = ?1 AND tool_calls_used < max_tool_calls
             RETURNING tool_calls_used",
            params![session_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| EngineError::Meta(format!("meta: charge session {session_id}: {e}")))
        .map(|n| n.map(|n| n as u64))
    }

    // ── Documents ─────────────────────────────────────────────────────────────

    /// Insert all rows in one transaction; either all commit or none do.
    pub fn create_documents_batch(&self, docs: &[DocumentRow]) -> Result<(), EngineError> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::Meta(format!("meta: begin document batch: {e}")))?;

        for doc in docs {
            let metadata_json = serde_json::to_string(&doc.metadata)
                .map_err(|e| EngineError::Meta(format!("meta: serialize document metadata: {e}")))?;
            tx.execute(
                "INSERT INTO documents (id, session_id, content_hash, source_kind, source_path, name, length_chars, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    doc.id,
                    doc.session_id,
                    doc.content_hash,
                    doc.source_kind,
                    doc.source_path,
                    doc.name,
                    doc.length_chars as i64,
                    doc.created_at,
                    metadata_json,
                ],
            )
            .map_err(|e| EngineError::Meta(format!("meta: insert document {}: {e}", doc.id)))?;
        }

        tx.commit()
            .map_err(|e| EngineError::Meta(format!("meta: commit document batch: {e}")))
    }

    pub fn get_document(
        &self,
        session_id: &str,
        doc_id: &str,
    ) -> Result<Option<DocumentRow>, EngineError> {
        let conn = self.open_conn()?;
        conn.query_row(
            "SELECT id, session_id, content_hash, source_kind, source_path, name, length_chars, created_at, metadata
             FROM documents WHERE session_id = ?1 AND id = ?2",
            params![session_id, doc_id],
            document_from_row,
        )
        .optional()
        .map_err(|e| EngineError::Meta(format!("meta: get document {doc_id}: {e}")))
    }

    pub fn list_documents(
        &self,
        session_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DocumentRow>, EngineError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, content_hash, source_kind, source_path, name, length_chars, created_at, metadata
                 FROM documents WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| EngineError::Meta(format!("meta: prepare list_documents: {e}")))?;

        let rows = stmt
            .query_map(params![session_id, limit as i64, offset as i64], document_from_row)
            .map_err(|e| EngineError::Meta(format!("meta: query list_documents: {e}")))?;

        collect_rows(rows, "list_documents")
    }

    pub fn all_documents(&self, session_id: &str) -> Result<Vec<DocumentRow>, EngineError> {
        self.list_documents(session_id, 0, i64::MAX as u64)
    }

    pub fn count_documents(&self, session_id: &str) -> Result<u64, EngineError> {
        self.count_rows("documents", session_id)
    }

    /// `(id, content_hash)` pairs in ascending document-id order — the input
    /// to the index fingerprint.
    pub fn document_fingerprints(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, String)>, EngineError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare("SELECT id, content_hash FROM documents WHERE session_id = ?1 ORDER BY id ASC")
            .map_err(|e| EngineError::Meta(format!("meta: prepare fingerprints: {e}")))?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| EngineError::Meta(format!("meta: query fingerprints: {e}")))?;

        collect_rows(rows, "fingerprints")
    }

    // ── Spans ─────────────────────────────────────────────────────────────────

    /// Insert spans in one transaction.  `INSERT OR IGNORE` keeps the call
    /// idempotent for deterministic chunk ids: re-chunking with an
    /// equivalent strategy reuses existing rows and never renumbers them.
    pub fn create_spans_batch(&self, spans: &[SpanRow]) -> Result<(), EngineError> {
        if spans.is_empty() {
            return Ok(());
        }
        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::Meta(format!("meta: begin span batch: {e}")))?;

        for span in spans {
            tx.execute(
                "INSERT OR IGNORE INTO spans (id, session_id, doc_id, start_byte, end_byte, content_hash, strategy, chunk_index, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    span.id,
                    span.session_id,
                    span.doc_id,
                    span.start as i64,
                    span.end as i64,
                    span.content_hash,
                    span.strategy,
                    span.chunk_index,
                    span.created_at,
                ],
            )
            .map_err(|e| EngineError::Meta(format!("meta: insert span {}: {e}", span.id)))?;
        }

        tx.commit()
            .map_err(|e| EngineError::Meta(format!("meta: commit span batch: {e}")))
    }

    pub fn get_span(&self, session_id: &str, span_id: &str) -> Result<Option<SpanRow>, EngineError> {
        let conn = self.open_conn()?;
        conn.query_row(
            "SELECT id, session_id, doc_id, start_byte, end_byte, content_hash, strategy, chunk_index, created_at
             FROM spans WHERE session_id = ?1 AND id = ?2",
            params![session_id, span_id],
            span_from_row,
        )
        .optional()
        .map_err(|e| EngineError::Meta(format!("meta: get span {span_id}: {e}")))
    }

    pub fn list_spans_by_document(
        &self,
        session_id: &str,
        doc_id: &str,
    ) -> Result<Vec<SpanRow>, EngineError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, doc_id, start_byte, end_byte, content_hash, strategy, chunk_index, created_at
                 FROM spans WHERE session_id = ?1 AND doc_id = ?2
                 ORDER BY chunk_index ASC, start_byte ASC",
            )
            .map_err(|e| EngineError::Meta(format!("meta: prepare list_spans: {e}")))?;

        let rows = stmt
            .query_map(params![session_id, doc_id], span_from_row)
            .map_err(|e| EngineError::Meta(format!("meta: query list_spans: {e}")))?;

        collect_rows(rows, "list_spans")
    }

    pub fn count_spans(&self, session_id: &str) -> Result<u64, EngineError> {
        self.count_rows("spans", session_id)
    }

    // ── Artifacts ─────────────────────────────────────────────────────────────

    pub fn create_artifact(&self, artifact: &ArtifactRow) -> Result<(), EngineError> {
        let conn = self.open_conn()?;
        let content_json = serde_json::to_string(&artifact.content)
            .map_err(|e| EngineError::Meta(format!("meta: serialize artifact content: {e}")))?;
        let provenance_json = artifact
            .provenance
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EngineError::Meta(format!("meta: serialize provenance: {e}")))?;

        conn.execute(
            "INSERT INTO artifacts (id, session_id, span_id, artifact_type, content, provenance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.id,
                artifact.session_id,
                artifact.span_id,
                artifact.artifact_type,
                content_json,
                provenance_json,
                artifact.created_at,
            ],
        )
        .map_err(|e| EngineError::Meta(format!("meta: insert artifact {}: {e}", artifact.id)))?;
        Ok(())
    }

    pub fn get_artifact(
        &self,
        session_id: &str,
        artifact_id: &str,
    ) -> Result<Option<ArtifactRow>, EngineError> {
        let conn = self.open_conn()?;
        conn.query_row(
            "SELECT id, session_id, span_id, artifact_type, content, provenance, created_at
             FROM artifacts WHERE session_id = ?1 AND id = ?2",
            params![session_id, artifact_id],
            artifact_from_row,
        )
        .optional()
        .map_err(|e| EngineError::Meta(format!("meta: get artifact {artifact_id}: {e}")))
    }

    /// Artifacts for a session, newest first, optionally filtered by span
    /// and/or type.
    pub fn list_artifacts(
        &self,
        session_id: &str,
        span_id: Option<&str>,
        artifact_type: Option<&str>,
    ) -> Result<Vec<ArtifactRow>, EngineError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, span_id, artifact_type, content, provenance, created_at
                 FROM artifacts WHERE session_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| EngineError::Meta(format!("meta: prepare list_artifacts: {e}")))?;

        let rows = stmt
            .query_map(params![session_id], artifact_from_row)
            .map_err(|e| EngineError::Meta(format!("meta: query list_artifacts: {e}")))?;

        let all = collect_rows(rows, "list_artifacts")?;
        Ok(all
            .into_iter()
            .filter(|a| span_id.is_none_or(|s| a.span_id.as_deref() == Some(s)))
            .filter(|a| artifact_type.is_none_or(|t| a.artifact_type == t))
            .collect())
    }

    pub fn count_artifacts(&self, session_id: &str) -> Result<u64, EngineError> {
        self.count_rows("artifacts", session_id)
    }

    // ── Traces ────────────────────────────────────────────────────────────────

    pub fn append_trace(&self, trace: &TraceRow) -> Result<(), EngineError> {
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT INTO traces (session_id, created_at, tool, input_summary, output_summary, duration_ms, ok, correlation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trace.session_id,
                trace.created_at,
                trace.tool,
                trace.input_summary,
                trace.output_summary,
                trace.duration_ms as i64,
                trace.ok,
                trace.correlation_id,
            ],
        )
        .map_err(|e| EngineError::Meta(format!("meta: append trace: {e}")))?;
        Ok(())
    }

    /// Most-recent `limit` traces (capped at [`TRACE_LIST_CAP`]), returned
    /// in chronological order.
    pub fn list_traces(&self, session_id: &str, limit: u64) -> Result<Vec<TraceRow>, EngineError> {
        let limit = limit.min(TRACE_LIST_CAP);
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, created_at, tool, input_summary, output_summary, duration_ms, ok, correlation_id
                 FROM traces WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
            )
            .map_err(|e| EngineError::Meta(format!("meta: prepare list_traces: {e}")))?;

        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok(TraceRow {
                    session_id: row.get(0)?,
                    created_at: row.get(1)?,
                    tool: row.get(2)?,
                    input_summary: row.get(3)?,
                    output_summary: row.get(4)?,
                    duration_ms: row.get::<_, i64>(5)? as u64,
                    ok: row.get(6)?,
                    correlation_id: row.get(7)?,
                })
            })
            .map_err(|e| EngineError::Meta(format!("meta: query list_traces: {e}")))?;

        let mut traces = collect_rows(rows, "list_traces")?;
        traces.reverse();
        Ok(traces)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn count_rows(&self, table: &str, session_id: &str) -> Result<u64, EngineError> {
        let conn = self.open_conn()?;
        // `table` comes from a fixed internal set, never from callers.
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE session_id = ?1");
        conn.query_row(&sql, params![session_id], |row| row.get::<_, i64>(0))
            .map_err(|e| EngineError::Meta(format!("meta: count {table}: {e}")))
            .map(|n| n as u64)
    }
}

fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
    let metadata_json: String = row.get(8)?;
    Ok(DocumentRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content_hash: row.get(2)?,
        source_kind: row.get(3)?,
        source_path: row.get(4)?,
        name: row.get(5)?,
        length_chars: row.get::<_, i64>(6)? as u64,
        created_at: row.get(7)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn span_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpanRow> {
    Ok(SpanRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        doc_id: row.get(2)?,
        start: row.get::<_, i64>(3)? as u64,
        end: row.get::<_, i64>(4)? as u64,
        content_hash: row.get(5)?,
        strategy: row.get(6)?,
        chunk_index: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn artifact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    let content_json: String = row.get(4)?;
    let provenance_json: Option<String> = row.get(5)?;
    Ok(ArtifactRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        span_id: row.get(2)?,
        artifact_type: row.get(3)?,
        content: serde_json::from_str(&content_json).unwrap_or(serde_json::Value::Null),
        provenance: provenance_json.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: row.get(6)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>, EngineError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| EngineError::Meta(format!("meta: map {what} row: {e}")))?);
    }
    Ok(out)
}

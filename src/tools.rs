//! The tool surface — canonical operation names and their wire shapes.
//!
//! Handlers form a closed set; the canonical dotted names are data, kept
//! separate from the dispatch machinery, and must be presented verbatim to
//! the transport.  Argument and result shapes are plain serde types.

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkStrategy;
use crate::config::{SessionConfig, SessionConfigPatch};
use crate::index::Highlight;

/// Every operation the engine exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    SessionCreate,
    SessionInfo,
    SessionClose,
    DocsLoad,
    DocsList,
    DocsPeek,
    ChunkCreate,
    SpanGet,
    SearchQuery,
    ArtifactStore,
    ArtifactList,
    ArtifactGet,
}

impl ToolName {
    pub const ALL: [ToolName; 12] = [
        ToolName::SessionCreate,
        ToolName::SessionInfo,
        ToolName::SessionClose,
        ToolName::DocsLoad,
        ToolName::DocsList,
        ToolName::DocsPeek,
        ToolName::ChunkCreate,
        ToolName::SpanGet,
        ToolName::SearchQuery,
        ToolName::ArtifactStore,
        ToolName::ArtifactList,
        ToolName::ArtifactGet,
    ];

    /// The canonical dotted name — an interface contract, not an
    /// implementation detail.
    pub fn canonical(&self) -> &'static str {
        match self {
            ToolName::SessionCreate => "session.create",
            ToolName::SessionInfo => "session.info",
            ToolName::SessionClose => "session.close",
            ToolName::DocsLoad => "docs.load",
            ToolName::DocsList => "docs.list",
            ToolName::DocsPeek => "docs.peek",
            ToolName::ChunkCreate => "chunk.create",
            ToolName::SpanGet => "span.get",
            ToolName::SearchQuery => "search.query",
            ToolName::ArtifactStore => "artifact.store",
            ToolName::ArtifactList => "artifact.list",
            ToolName::ArtifactGet => "artifact.get",
        }
    }

    pub fn parse(name: &str) -> Option<ToolName> {
        ToolName::ALL.iter().copied().find(|t| t.canonical() == name)
    }
}

/// Whether a transport can register `name` as-is: a lowercase category
/// prefix, one dot, and a lowercase action with optional underscores.
pub fn name_is_registrable(name: &str) -> bool {
    let Some((category, action)) = name.split_once('.') else {
        return false;
    };
    !category.is_empty()
        && !action.is_empty()
        && category.bytes().all(|b| b.is_ascii_lowercase())
        && action
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b == b'_')
}

/// Fallback name used when the transport cannot register the canonical one
/// and `allow_noncanonical_tool_names` permits fabrication.
pub fn fabricated_name(name: &str) -> String {
    name.replace('.', "_")
}

// ── session.* ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionCreateParams {
    pub name: Option<String>,
    pub config: Option<SessionConfigPatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateResult {
    pub session_id: String,
    pub name: String,
    pub config: SessionConfig,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfoParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfoResult {
    pub session_id: String,
    pub name: String,
    pub status: String,
    pub document_count: u64,
    pub span_count: u64,
    pub artifact_count: u64,
    pub tool_calls_used: u64,
    pub tool_calls_remaining: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionCloseParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCloseResult {
    pub session_id: String,
    pub status: String,
    pub document_count: u64,
    pub span_count: u64,
    pub artifact_count: u64,
    pub tool_calls_used: u64,
}

// ── docs.* ────────────────────────────────────────────────────────────────────

/// A source specification accepted by `docs.load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Inline {
        text: String,
        #[serde(default)]
        name: Option<String>,
    },
    File {
        path: String,
    },
    Dir {
        path: String,
        /// Glob applied inside the directory; `**/*` when absent.
        #[serde(default)]
        pattern: Option<String>,
    },
    Glob {
        pattern: String,
    },
}

impl SourceSpec {
    /// Short description used in per-source error strings.
    pub fn describe(&self) -> String {
        match self {
            SourceSpec::Inline { name, .. } => match name {
                Some(n) => format!("inline:{n}"),
                None => "inline".to_string(),
            },
            SourceSpec::File { path } => format!("file:{path}"),
            SourceSpec::Dir { path, .. } => format!("dir:{path}"),
            SourceSpec::Glob { pattern } => format!("glob:{pattern}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocsLoadParams {
    pub session_id: String,
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedDoc {
    pub doc_id: String,
    pub name: String,
    pub content_hash: String,
    pub length_chars: u64,
    pub token_estimate: u64,
}

/// One failed source; failures never abort sibling sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadFailure {
    pub source: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocsLoadResult {
    pub loaded: Vec<LoadedDoc>,
    pub errors: Vec<LoadFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocsListParams {
    pub session_id: String,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub doc_id: String,
    pub name: String,
    pub content_hash: String,
    pub source_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub length_chars: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocsListResult {
    pub documents: Vec<DocRecord>,
    pub total: u64,
    pub page: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocsPeekParams {
    pub session_id: String,
    pub doc_id: String,
    #[serde(default)]
    pub start: Option<u64>,
    #[serde(default)]
    pub end: Option<u64>,
}

/// Reference to a byte range of a document — the provenance unit carried by
/// every content-bearing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    pub doc_id: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocsPeekResult {
    pub content: String,
    pub content_hash: String,
    pub truncated: bool,
    pub length_chars: u64,
    pub span: SpanRef,
}

// ── chunk.* / span.* ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkCreateParams {
    pub session_id: String,
    pub doc_id: String,
    pub strategy: ChunkStrategy,
    #[serde(default)]
    pub max_chunks: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub span_id: String,
    pub chunk_index: u32,
    pub start: u64,
    pub end: u64,
    pub content_hash: String,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCreateResult {
    pub doc_id: String,
    pub spans: Vec<ChunkInfo>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpanGetParams {
    pub session_id: String,
    pub span_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanContent {
    pub span_id: String,
    pub span: SpanRef,
    pub content: String,
    pub content_hash: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanGetResult {
    pub spans: Vec<SpanContent>,
    pub truncated: bool,
}

// ── search.* ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    #[default]
    Bm25,
    Regex,
    Literal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQueryParams {
    pub session_id: String,
    pub query: String,
    #[serde(default)]
    pub method: SearchMethod,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub context_chars: Option<usize>,
    #[serde(default)]
    pub doc_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    pub doc_id: String,
    pub doc_name: String,
    pub span: SpanRef,
    pub score: f32,
    pub context: String,
    pub highlights: Vec<Highlight>,
}

/// Which tier served the index for a BM25 query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSource {
    Memory,
    Disk,
    Built,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQueryResult {
    pub matches: Vec<SearchMatch>,
    pub method: SearchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_source: Option<IndexSource>,
    pub truncated: bool,
}

// ── artifact.* ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Inline span creation inside `artifact.store`.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineSpan {
    pub doc_id: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactStoreParams {
    pub session_id: String,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub span: Option<InlineSpan>,
    pub artifact_type: String,
    pub content: serde_json::Value,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStoreResult {
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactListParams {
    pub session_id: String,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub artifact_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub artifact_type: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactListResult {
    pub artifacts: Vec<ArtifactRecord>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactGetParams {
    pub session_id: String,
    pub artifact_id: String,
}

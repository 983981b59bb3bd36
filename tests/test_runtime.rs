//! End-to-end scenarios for the session runtime: lifecycle, concurrency,
//! budget enforcement, partial loads, and span provenance errors.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::TempDir;

use corpusd::config::ServerConfig;
use corpusd::error::EngineError;
use corpusd::runtime::Runtime;
use corpusd::tools::ToolName;

// ── helpers ──────────────────────────────────────────────────────────────────

fn runtime_at(dir: &Path) -> Arc<Runtime> {
    Runtime::new(ServerConfig::test_default(dir)).expect("runtime builds")
}

async fn call(rt: &Arc<Runtime>, tool: ToolName, params: Value) -> Result<Value, EngineError> {
    rt.dispatch(tool, params).await
}

async fn create_session(rt: &Arc<Runtime>, max_tool_calls: u64) -> String {
    let result = call(
        rt,
        ToolName::SessionCreate,
        json!({ "name": "test", "config": { "max_tool_calls": max_tool_calls } }),
    )
    .await
    .expect("session.create succeeds");
    result["session_id"].as_str().unwrap().to_string()
}

async fn load_inline(rt: &Arc<Runtime>, session_id: &str, texts: &[&str]) -> Value {
    let sources: Vec<Value> = texts
        .iter()
        .map(|t| json!({ "kind": "inline", "text": t }))
        .collect();
    call(
        rt,
        ToolName::DocsLoad,
        json!({ "session_id": session_id, "sources": sources }),
    )
    .await
    .expect("docs.load succeeds")
}

async fn tool_calls_used(rt: &Arc<Runtime>, session_id: &str) -> u64 {
    let info = call(rt, ToolName::SessionInfo, json!({ "session_id": session_id }))
        .await
        .expect("session.info succeeds");
    info["tool_calls_used"].as_u64().unwrap()
}

// ── S1: lifecycle with persistence ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_search_close_reopen_hits_disk() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 10).await;

    load_inline(&rt, &session, &["The Python programming language is used widely."]).await;

    let query = json!({ "session_id": session, "query": "python language" });
    let first = call(&rt, ToolName::SearchQuery, query.clone()).await.unwrap();
    assert_eq!(first["index_source"], "built");
    let top = &first["matches"][0];
    let context = top["context"].as_str().unwrap();
    assert!(context.contains("Python"));
    assert!(context.contains("language"));
    let span = &top["span"];
    assert!(span["end"].as_u64().unwrap() > span["start"].as_u64().unwrap());

    call(&rt, ToolName::SessionClose, json!({ "session_id": session }))
        .await
        .unwrap();
    drop(rt);

    // A fresh runtime over the same data dir must serve the persisted index
    // without rebuilding.
    let rt = runtime_at(temp.path());
    let second = call(&rt, ToolName::SearchQuery, query).await.unwrap();
    assert_eq!(second["index_source"], "disk");
    assert_eq!(
        second["matches"][0]["doc_id"],
        first["matches"][0]["doc_id"]
    );
}

// ── S2: concurrent index build under lock ────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_searches_build_index_exactly_once() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 100).await;

    let texts: Vec<String> = (0..10)
        .map(|i| format!("document number {i} mentions shared vocabulary and topic{i}"))
        .collect();
    load_inline(
        &rt,
        &session,
        &texts.iter().map(String::as_str).collect::<Vec<_>>(),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let rt = Arc::clone(&rt);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            call(
                &rt,
                ToolName::SearchQuery,
                json!({ "session_id": session, "query": "shared vocabulary" }),
            )
            .await
            .expect("search succeeds")
        }));
    }

    let mut built = 0usize;
    let mut top_docs = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        if result["index_source"] == "built" {
            built += 1;
        }
        top_docs.push(result["matches"][0]["doc_id"].as_str().unwrap().to_string());
    }

    assert_eq!(built, 1, "exactly one search may build the index");
    assert!(top_docs.windows(2).all(|w| w[0] == w[1]));

    // create + load + 50 searches + this info call's own charge
    assert_eq!(tool_calls_used(&rt, &session).await, 53);
}

// ── S3: budget boundary ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_boundary_exact_successes() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    // session.create consumes one of the three charges.
    let session = create_session(&rt, 3).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let rt = Arc::clone(&rt);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            call(&rt, ToolName::SessionInfo, json!({ "session_id": session })).await
        }));
    }

    let mut ok = 0usize;
    let mut denied = 0usize;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::BudgetExceeded { used, limit }) => {
                assert_eq!(used, 3);
                assert_eq!(limit, 3);
                denied += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(denied, 2);

    // Denied calls must not have incremented the counter.
    let meta = corpusd::store::meta::MetaStore::open(temp.path()).unwrap();
    let row = meta.get_session(&session).unwrap().unwrap();
    assert_eq!(row.tool_calls_used, 3);
}

// ── S4: partial batch load ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn partial_batch_load_reports_errors_and_commits_survivors() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 20).await;

    let result = call(
        &rt,
        ToolName::DocsLoad,
        json!({
            "session_id": session,
            "sources": [
                { "kind": "inline", "text": "ok-1" },
                { "kind": "file", "path": "/nonexistent/missing.txt" },
                { "kind": "inline", "text": "ok-2" },
            ]
        }),
    )
    .await
    .unwrap();

    assert_eq!(result["loaded"].as_array().unwrap().len(), 2);
    let errors = result["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["kind"], "FileNotFound");
    assert!(errors[0]["message"].as_str().unwrap().contains("missing.txt"));

    let meta = corpusd::store::meta::MetaStore::open(temp.path()).unwrap();
    assert_eq!(meta.count_documents(&session).unwrap(), 2);

    // Both survivors are searchable.
    for query in ["ok-1", "ok-2"] {
        let found = call(
            &rt,
            ToolName::SearchQuery,
            json!({ "session_id": session, "query": query }),
        )
        .await
        .unwrap();
        assert!(
            !found["matches"].as_array().unwrap().is_empty(),
            "no match for {query}"
        );
    }
}

// ── S7: span error carries chunk index ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn missing_span_error_names_document_and_chunk_index() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 30).await;

    let loaded = load_inline(&rt, &session, &["0123456789012345678901234567890123456789012345678"]).await;
    let doc_id = loaded["loaded"][0]["doc_id"].as_str().unwrap().to_string();

    let chunks = call(
        &rt,
        ToolName::ChunkCreate,
        json!({
            "session_id": session,
            "doc_id": doc_id,
            "strategy": { "kind": "fixed", "chunk_size": 10 }
        }),
    )
    .await
    .unwrap();
    let spans = chunks["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 5);
    let third = spans[2]["span_id"].as_str().unwrap().to_string();

    // A fabricated span id yields a session-level hint.
    let err = call(
        &rt,
        ToolName::SpanGet,
        json!({ "session_id": session, "span_ids": ["totally-made-up"] }),
    )
    .await
    .unwrap_err();
    match &err {
        EngineError::SpanNotFound(msg) => {
            assert!(msg.contains(&session));
            assert!(msg.contains("ck_<doc>"));
        }
        other => panic!("expected SpanNotFound, got {other}"),
    }

    // Delete the third chunk's row behind the engine's back.
    let conn = rusqlite::Connection::open(temp.path().join("metadata.db")).unwrap();
    conn.execute("DELETE FROM spans WHERE id = ?1", rusqlite::params![third])
        .unwrap();

    let err = call(
        &rt,
        ToolName::SpanGet,
        json!({ "session_id": session, "span_ids": [third] }),
    )
    .await
    .unwrap_err();
    match &err {
        EngineError::SpanNotFound(msg) => {
            assert!(msg.contains("inline-1"), "message should name the document: {msg}");
            assert!(msg.contains("chunk_index 2"), "message should carry the index: {msg}");
        }
        other => panic!("expected SpanNotFound, got {other}"),
    }
}

// ── Session state machine ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn closed_sessions_reject_mutation_but_allow_inspection() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 20).await;
    load_inline(&rt, &session, &["content before close"]).await;

    let closed = call(&rt, ToolName::SessionClose, json!({ "session_id": session }))
        .await
        .unwrap();
    assert_eq!(closed["status"], "completed");

    let err = call(&rt, ToolName::SessionClose, json!({ "session_id": session }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionAlreadyClosed(_)));

    let err = call(
        &rt,
        ToolName::DocsLoad,
        json!({ "session_id": session, "sources": [{ "kind": "inline", "text": "late" }] }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::SessionClosed(_)));

    let info = call(&rt, ToolName::SessionInfo, json!({ "session_id": session }))
        .await
        .unwrap();
    assert_eq!(info["status"], "completed");
    assert_eq!(info["document_count"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_session_fails_closed() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let err = call(
        &rt,
        ToolName::SessionInfo,
        json!({ "session_id": "00000000-0000-0000-0000-000000000000" }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::SessionNotFound(_)));
}

// ── Peek, caps, and provenance ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn peek_returns_range_and_honors_peek_cap() {
    let temp = TempDir::new().unwrap();
    let mut cfg = ServerConfig::test_default(temp.path());
    cfg.session_defaults.max_chars_per_peek = 10;
    let rt = Runtime::new(cfg).unwrap();
    let session = create_session(&rt, 20).await;

    let text = "abcdefghijklmnopqrstuvwxyz";
    let loaded = load_inline(&rt, &session, &[text]).await;
    let doc_id = loaded["loaded"][0]["doc_id"].as_str().unwrap().to_string();

    let peek = call(
        &rt,
        ToolName::DocsPeek,
        json!({ "session_id": session, "doc_id": doc_id, "start": 2, "end": 7 }),
    )
    .await
    .unwrap();
    assert_eq!(peek["content"], "cdefg");
    assert_eq!(peek["truncated"], false);
    assert_eq!(peek["span"]["start"], 2);
    assert_eq!(peek["span"]["end"], 7);
    assert_eq!(peek["length_chars"], 26);

    // Full peek runs into the 10-byte cap.
    let peek = call(
        &rt,
        ToolName::DocsPeek,
        json!({ "session_id": session, "doc_id": doc_id }),
    )
    .await
    .unwrap();
    assert_eq!(peek["content"], "abcdefghij");
    assert_eq!(peek["truncated"], true);

    let err = call(
        &rt,
        ToolName::DocsPeek,
        json!({ "session_id": session, "doc_id": doc_id, "start": 99 }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn span_roundtrip_preserves_bytes_and_hash() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 30).await;

    let loaded = load_inline(&rt, &session, &["alpha beta gamma delta epsilon"]).await;
    let doc_id = loaded["loaded"][0]["doc_id"].as_str().unwrap().to_string();

    let chunks = call(
        &rt,
        ToolName::ChunkCreate,
        json!({
            "session_id": session,
            "doc_id": doc_id,
            "strategy": { "kind": "fixed", "chunk_size": 11 }
        }),
    )
    .await
    .unwrap();
    let first = &chunks["spans"][0];
    let span_id = first["span_id"].as_str().unwrap();

    let got = call(
        &rt,
        ToolName::SpanGet,
        json!({ "session_id": session, "span_ids": [span_id] }),
    )
    .await
    .unwrap();
    let span = &got["spans"][0];
    assert_eq!(span["content"], "alpha beta ");
    assert_eq!(span["content_hash"], first["content_hash"]);
    assert_eq!(span["span"]["doc_id"].as_str().unwrap(), doc_id);

    // Re-chunking with the same strategy reuses span ids.
    let again = call(
        &rt,
        ToolName::ChunkCreate,
        json!({
            "session_id": session,
            "doc_id": doc_id,
            "strategy": { "kind": "fixed", "chunk_size": 11 }
        }),
    )
    .await
    .unwrap();
    assert_eq!(again["spans"][0]["span_id"], first["span_id"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn artifacts_attach_to_inline_spans() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 30).await;

    let loaded = load_inline(&rt, &session, &["evidence lives at byte offsets"]).await;
    let doc_id = loaded["loaded"][0]["doc_id"].as_str().unwrap().to_string();

    let stored = call(
        &rt,
        ToolName::ArtifactStore,
        json!({
            "session_id": session,
            "span": { "doc_id": doc_id, "start": 0, "end": 8 },
            "artifact_type": "summary",
            "content": { "text": "evidence" },
            "provenance": { "model": "external-model" }
        }),
    )
    .await
    .unwrap();
    let artifact_id = stored["artifact_id"].as_str().unwrap();
    let span_id = stored["span_id"].as_str().unwrap().to_string();
    assert!(span_id.starts_with("sp_"));

    let fetched = call(
        &rt,
        ToolName::ArtifactGet,
        json!({ "session_id": session, "artifact_id": artifact_id }),
    )
    .await
    .unwrap();
    assert_eq!(fetched["artifact_type"], "summary");
    assert_eq!(fetched["content"]["text"], "evidence");
    assert_eq!(fetched["provenance"]["model"], "external-model");
    assert!(fetched["provenance"]["created_at"].is_string());

    // The inline span is a real span: retrievable with content.
    let got = call(
        &rt,
        ToolName::SpanGet,
        json!({ "session_id": session, "span_ids": [span_id] }),
    )
    .await
    .unwrap();
    assert_eq!(got["spans"][0]["content"], "evidence");

    // Filtered listing finds it; a session-level artifact has no span.
    let listed = call(
        &rt,
        ToolName::ArtifactList,
        json!({ "session_id": session, "artifact_type": "summary" }),
    )
    .await
    .unwrap();
    assert_eq!(listed["artifacts"].as_array().unwrap().len(), 1);

    let err = call(
        &rt,
        ToolName::ArtifactGet,
        json!({ "session_id": session, "artifact_id": "missing" }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::ArtifactNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn search_methods_share_result_shape() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt, 30).await;
    load_inline(
        &rt,
        &session,
        &["the ERROR-42 code appears twice: ERROR-42", "clean document"],
    )
    .await;

    let regex = call(
        &rt,
        ToolName::SearchQuery,
        json!({ "session_id": session, "query": r"ERROR-\d+", "method": "regex" }),
    )
    .await
    .unwrap();
    assert!(regex["index_source"].is_null());
    assert_eq!(regex["matches"].as_array().unwrap().len(), 1);
    assert_eq!(regex["matches"][0]["score"], 2.0);
    let highlight = &regex["matches"][0]["highlights"][0];
    assert_eq!(highlight["terms"][0], "ERROR-42");

    let literal = call(
        &rt,
        ToolName::SearchQuery,
        json!({ "session_id": session, "query": "clean document", "method": "literal" }),
    )
    .await
    .unwrap();
    assert_eq!(literal["matches"].as_array().unwrap().len(), 1);
    assert!(
        literal["matches"][0]["context"]
            .as_str()
            .unwrap()
            .contains("clean document")
    );

    let err = call(
        &rt,
        ToolName::SearchQuery,
        json!({ "session_id": session, "query": "([", "method": "regex" }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn response_cap_truncates_search_context() {
    let temp = TempDir::new().unwrap();
    let mut cfg = ServerConfig::test_default(temp.path());
    cfg.session_defaults.max_chars_per_response = 40;
    let rt = Runtime::new(cfg).unwrap();
    let session = create_session(&rt, 30).await;

    let long = format!("needle {}", "filler words ".repeat(40));
    load_inline(&rt, &session, &[&long]).await;

    let result = call(
        &rt,
        ToolName::SearchQuery,
        json!({ "session_id": session, "query": "needle", "context_chars": 300 }),
    )
    .await
    .unwrap();
    assert_eq!(result["truncated"], true);
    assert!(result["matches"][0]["context"].as_str().unwrap().len() <= 40);
}

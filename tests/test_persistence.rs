//! Index snapshot lifecycle against the runtime: staleness on mutation,
//! crash-safety of the write protocol, and self-healing on corruption.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::TempDir;

use corpusd::config::ServerConfig;
use corpusd::error::EngineError;
use corpusd::index::persist::{IndexMeta, IndexStore, compute_fingerprint};
use corpusd::index::{Bm25Index, tokenizer};
use corpusd::runtime::Runtime;
use corpusd::tools::ToolName;

fn runtime_at(dir: &Path) -> Arc<Runtime> {
    Runtime::new(ServerConfig::test_default(dir)).expect("runtime builds")
}

async fn call(rt: &Arc<Runtime>, tool: ToolName, params: Value) -> Result<Value, EngineError> {
    rt.dispatch(tool, params).await
}

async fn create_session(rt: &Arc<Runtime>) -> String {
    call(rt, ToolName::SessionCreate, json!({ "name": "persistence" }))
        .await
        .expect("session.create succeeds")["session_id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn load_one(rt: &Arc<Runtime>, session: &str, text: &str) -> (String, String) {
    let result = call(
        rt,
        ToolName::DocsLoad,
        json!({ "session_id": session, "sources": [{ "kind": "inline", "text": text }] }),
    )
    .await
    .expect("docs.load succeeds");
    (
        result["loaded"][0]["doc_id"].as_str().unwrap().to_string(),
        result["loaded"][0]["content_hash"].as_str().unwrap().to_string(),
    )
}

async fn search(rt: &Arc<Runtime>, session: &str, query: &str) -> Value {
    call(
        rt,
        ToolName::SearchQuery,
        json!({ "session_id": session, "query": query }),
    )
    .await
    .expect("search succeeds")
}

// ── S5: staleness on mutation ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn docs_load_invalidates_snapshot_and_next_search_rebuilds() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt).await;
    let (doc_id, content_hash) = load_one(&rt, &session, "alpha original content").await;

    // Persist a snapshot matching the current single-document state, as a
    // prior `session.close` would have.
    let store = IndexStore::open(&temp.path().join("indexes")).unwrap();
    let tok = tokenizer::lookup(tokenizer::DEFAULT_TOKENIZER).unwrap();
    let index = Bm25Index::build(&[(doc_id.clone(), "alpha original content".into())], tok);
    let fp = compute_fingerprint(&[(doc_id, content_hash)]);
    store
        .save(&session, &index, &IndexMeta::new(1, tok.name(), fp))
        .unwrap();

    // A fresh runtime serves that snapshot.
    let rt = runtime_at(temp.path());
    assert_eq!(search(&rt, &session, "alpha").await["index_source"], "disk");

    // Reopen once more so the in-memory cache starts cold, then mutate.
    let rt = runtime_at(temp.path());
    load_one(&rt, &session, "beta newly loaded content").await;

    // The on-disk snapshot is gone before any further search runs.
    let session_index = temp.path().join("indexes").join(&session).join("index");
    assert!(!session_index.exists());

    // The next search rebuilds and sees the new document.
    let result = search(&rt, &session, "beta").await;
    assert_eq!(result["index_source"], "built");
    assert_eq!(result["matches"].as_array().unwrap().len(), 1);
    assert!(
        result["matches"][0]["context"]
            .as_str()
            .unwrap()
            .contains("beta")
    );
}

// ── S6: crash-safety surrogate ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn crash_residue_is_cleaned_and_previous_snapshot_served() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt).await;
    load_one(&rt, &session, "durable snapshot content").await;
    search(&rt, &session, "durable").await;
    call(&rt, ToolName::SessionClose, json!({ "session_id": session }))
        .await
        .unwrap();
    drop(rt);

    // Fault-inject: a writer died after writing temp files, before the
    // renames.
    let dir = temp.path().join("indexes").join(&session);
    std::fs::write(dir.join("index.tmp"), b"half-written").unwrap();
    std::fs::write(dir.join("metadata.tmp"), b"half-written").unwrap();

    let rt = runtime_at(temp.path());
    let result = search(&rt, &session, "durable").await;
    assert_eq!(result["index_source"], "disk");
    assert!(!dir.join("index.tmp").exists());
    assert!(!dir.join("metadata.tmp").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_snapshot_heals_by_rebuild() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt).await;
    load_one(&rt, &session, "self healing index content").await;
    search(&rt, &session, "healing").await;
    call(&rt, ToolName::SessionClose, json!({ "session_id": session }))
        .await
        .unwrap();
    drop(rt);

    let index_file = temp.path().join("indexes").join(&session).join("index");
    std::fs::write(&index_file, b"garbage bytes").unwrap();

    // The caller never sees IndexCorrupt; the query succeeds off a rebuild.
    let rt = runtime_at(temp.path());
    let result = search(&rt, &session, "healing").await;
    assert_eq!(result["index_source"], "built");
    assert!(!result["matches"].as_array().unwrap().is_empty());
}

// ── Staleness discriminators ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn tokenizer_rename_forces_rebuild() {
    let temp = TempDir::new().unwrap();
    let rt = runtime_at(temp.path());
    let session = create_session(&rt).await;
    load_one(&rt, &session, "tokenizer identity is part of the snapshot").await;
    search(&rt, &session, "tokenizer").await;
    call(&rt, ToolName::SessionClose, json!({ "session_id": session }))
        .await
        .unwrap();
    drop(rt);

    // Same data dir, different configured tokenizer name.
    let mut cfg = ServerConfig::test_default(temp.path());
    cfg.tokenizer = "ascii-v1".to_string();
    let rt = Runtime::new(cfg).unwrap();
    let result = search(&rt, &session, "tokenizer").await;
    assert_eq!(result["index_source"], "built");

    // The stale snapshot was deleted on the way.
    assert!(!temp.path().join("indexes").join(&session).join("index").exists());
}

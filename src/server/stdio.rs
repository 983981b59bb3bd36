//! Line-delimited JSON request/response loop over stdin/stdout.
//!
//! One JSON object per line: `{"id": ..., "method": "search.query",
//! "params": {...}}` in, `{"id": ..., "result": {...}}` or `{"id": ...,
//! "error": {"kind": ..., "message": ...}}` out.  Requests run as
//! concurrent tasks; responses are serialized through a single writer task
//! so concurrent tool calls never interleave bytes on stdout.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ToolRegistry;
use crate::error::EngineError;
use crate::runtime::Runtime;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, kind: &str, message: String) -> Self {
        Response {
            id,
            result: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message,
            }),
        }
    }

    fn from_engine_error(id: Value, e: &EngineError) -> Self {
        Response::err(id, e.kind_tag(), e.to_string())
    }
}

/// Serve until stdin closes or `shutdown` is cancelled.
pub async fn serve(
    runtime: Arc<Runtime>,
    registry: Arc<ToolRegistry>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("stdio transport ready");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("stdio transport shutting down");
                break;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    Ok(None) => {
                        info!("stdin closed, stdio transport exiting");
                        break;
                    }
                    Err(e) => {
                        warn!("stdio read error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(line, &runtime, &registry, &out_tx);
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

fn handle_line(
    line: String,
    runtime: &Arc<Runtime>,
    registry: &Arc<ToolRegistry>,
    out_tx: &mpsc::Sender<String>,
) {
    let request: Request = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            send(
                out_tx.clone(),
                Response::err(Value::Null, "InvalidArgument", format!("malformed request: {e}")),
            );
            return;
        }
    };

    let Some(tool) = registry.resolve(&request.method) else {
        send(
            out_tx.clone(),
            Response::err(
                request.id,
                "InvalidArgument",
                format!("unknown method: {}", request.method),
            ),
        );
        return;
    };

    let runtime = Arc::clone(runtime);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let response = match runtime.dispatch(tool, request.params).await {
            Ok(result) => Response::ok(request.id, result),
            Err(e) => Response::from_engine_error(request.id, &e),
        };
        send(out_tx, response);
    });
}

fn send(out_tx: mpsc::Sender<String>, response: Response) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            tokio::spawn(async move {
                let _ = out_tx.send(line).await;
            });
        }
        Err(e) => warn!("response serialization failed: {e}"),
    }
}

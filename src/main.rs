//! corpusd — engine entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config (optional path as the first argument)
//!   3. Init logger at the configured level and format
//!   4. Build the runtime rooted at `data_dir`
//!   5. Register canonical tool names (fail closed on naming failure)
//!   6. Serve the stdio transport until EOF or a shutdown signal

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use corpusd::{config, error::EngineError, logger, runtime::Runtime, server};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), EngineError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let config_path = std::env::args().nth(1);
    let cfg = config::load(config_path.as_deref())?;

    logger::init(&cfg.log_level, cfg.structured_logging, cfg.log_file.as_deref())?;

    info!(
        data_dir = %cfg.data_dir.display(),
        tokenizer = %cfg.tokenizer,
        log_level = %cfg.log_level,
        "config loaded"
    );

    // Canonical names must register verbatim unless config says otherwise.
    let registry = Arc::new(server::ToolRegistry::build(
        cfg.allow_noncanonical_tool_names,
    )?);

    let runtime = Runtime::new(cfg)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(EngineError::Io)?
        .block_on(async move {
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            server::stdio::serve(runtime, registry, shutdown).await;
        });

    info!("corpusd exiting");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("cannot install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received");
        }
        shutdown.cancel();
    });
}

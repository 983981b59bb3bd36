//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once at startup, after the server config is resolved.
//! `structured_logging` switches the formatter to JSON; `log_file` redirects
//! the sink from stderr to an append-mode file.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Initialise the global tracing subscriber.
///
/// `level` accepts standard level strings: `"error"`, `"warn"`, `"info"`,
/// `"debug"`, `"trace"`.  `RUST_LOG` takes precedence when set; `level` is
/// the fallback.
pub fn init(level: &str, structured: bool, log_file: Option<&Path>) -> Result<(), EngineError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| EngineError::Logger(format!("invalid log level '{level}': {e}")))?;

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    EngineError::Logger(format!("cannot open log file {}: {e}", path.display()))
                })?;
            init_with_writer(filter, structured, std::sync::Mutex::new(file))
        }
        None => init_with_writer(filter, structured, std::io::stderr),
    }
}

fn init_with_writer<W>(filter: EnvFilter, structured: bool, writer: W) -> Result<(), EngineError>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    let result = if structured {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| EngineError::Logger(format!("failed to set subscriber: {e}")))
}

/// Parse a log level string into a [`LevelFilter`], returning an error on
/// unrecognised values. Config loading calls this so a bad `log_level` is
/// rejected at resolve time, before the subscriber exists.
pub fn parse_level(level: &str) -> Result<LevelFilter, EngineError> {
    if level.is_empty() {
        return Err(EngineError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| EngineError::Logger(format!("unrecognised log level: '{level}'")))
}

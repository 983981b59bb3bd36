//! Configuration loading with env-var overrides.
//!
//! Reads a TOML file (default `config/default.toml` relative to the current
//! working directory), applies `CORPUSD_DATA_DIR` and `CORPUSD_LOG_LEVEL`
//! env overrides, and validates the resolved log level before the runtime
//! starts.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::logger;

/// Hard caps applied by the loader to every `docs.load` call.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Semaphore capacity: how many files may be held in memory at once.
    pub max_concurrent_loads: usize,
    /// Per-file size cap in megabytes.
    pub max_file_size_mb: u64,
}

/// Defaults stamped into each new session's config.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub max_tool_calls: u64,
    pub max_chars_per_response: usize,
    pub max_chars_per_peek: usize,
}

/// Fully-resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root of the metadata, blob, and index subtrees (already expanded, no `~`).
    pub data_dir: PathBuf,
    pub log_level: String,
    /// Emit traces as JSON instead of human-readable lines.
    pub structured_logging: bool,
    /// Optional log sink; stderr when absent.
    pub log_file: Option<PathBuf>,
    /// Name of the tokenizer every index must be built with.
    pub tokenizer: String,
    /// If false, startup fails when the transport cannot register canonical
    /// tool names verbatim.
    pub allow_noncanonical_tool_names: bool,
    pub loader: LoaderConfig,
    pub session_defaults: SessionDefaults,
}

/// Per-session budget and cap record, stored on the session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard cap on `tool_calls_used`; charging past it denies the call.
    pub max_tool_calls: u64,
    /// Total bytes of user-visible content returned by any single call.
    pub max_chars_per_response: usize,
    /// Additional cap specific to `docs.peek`.
    pub max_chars_per_peek: usize,
    /// May short-circuit identical chunk requests.
    #[serde(default = "default_true")]
    pub chunk_cache_enabled: bool,
    /// Advisory metadata passed through; the engine does not act on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hints: Option<serde_json::Value>,
}

/// Partial overrides accepted by `session.create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfigPatch {
    pub max_tool_calls: Option<u64>,
    pub max_chars_per_response: Option<usize>,
    pub max_chars_per_peek: Option<usize>,
    pub chunk_cache_enabled: Option<bool>,
    pub model_hints: Option<serde_json::Value>,
}

impl ServerConfig {
    /// Resolve a new session's config from the server defaults plus overrides.
    pub fn session_config(&self, patch: Option<SessionConfigPatch>) -> SessionConfig {
        let patch = patch.unwrap_or_default();
        SessionConfig {
            max_tool_calls: patch
                .max_tool_calls
                .unwrap_or(self.session_defaults.max_tool_calls),
            max_chars_per_response: patch
                .max_chars_per_response
                .unwrap_or(self.session_defaults.max_chars_per_response),
            max_chars_per_peek: patch
                .max_chars_per_peek
                .unwrap_or(self.session_defaults.max_chars_per_peek),
            chunk_cache_enabled: patch.chunk_cache_enabled.unwrap_or(true),
            model_hints: patch.model_hints,
        }
    }
}

fn default_true() -> bool {
    true
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    loader: RawLoader,
    #[serde(default)]
    session_defaults: RawSessionDefaults,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    structured_logging: bool,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default = "default_tokenizer")]
    tokenizer: String,
    #[serde(default)]
    allow_noncanonical_tool_names: bool,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            structured_logging: false,
            log_file: None,
            tokenizer: default_tokenizer(),
            allow_noncanonical_tool_names: false,
        }
    }
}

#[derive(Deserialize)]
struct RawLoader {
    #[serde(default = "default_max_concurrent_loads")]
    max_concurrent_loads: usize,
    #[serde(default = "default_max_file_size_mb")]
    max_file_size_mb: u64,
}

impl Default for RawLoader {
    fn default() -> Self {
        Self {
            max_concurrent_loads: default_max_concurrent_loads(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

#[derive(Deserialize)]
struct RawSessionDefaults {
    #[serde(default = "default_max_tool_calls")]
    max_tool_calls: u64,
    #[serde(default = "default_max_chars_per_response")]
    max_chars_per_response: usize,
    #[serde(default = "default_max_chars_per_peek")]
    max_chars_per_peek: usize,
}

impl Default for RawSessionDefaults {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            max_chars_per_response: default_max_chars_per_response(),
            max_chars_per_peek: default_max_chars_per_peek(),
        }
    }
}

fn default_data_dir() -> String { "~/.corpusd".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_tokenizer() -> String { "unicode-v1".to_string() }
fn default_max_concurrent_loads() -> usize { 8 }
fn default_max_file_size_mb() -> u64 { 10 }
fn default_max_tool_calls() -> u64 { 100 }
fn default_max_chars_per_response() -> usize { 50_000 }
fn default_max_chars_per_peek() -> usize { 8_000 }

// ── Public loaders ────────────────────────────────────────────────────────────

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides.  If no path is given and the default file does not
/// exist, returns hardcoded defaults.
pub fn load(config_path: Option<&str>) -> Result<ServerConfig, EngineError> {
    let data_dir_override = env::var("CORPUSD_DATA_DIR").ok();
    let log_level_override = env::var("CORPUSD_LOG_LEVEL").ok();

    if let Some(path) = config_path {
        // If explicitly provided, it must exist and be valid.
        return load_from(
            Path::new(path),
            data_dir_override.as_deref(),
            log_level_override.as_deref(),
        );
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(
            default_path,
            data_dir_override.as_deref(),
            log_level_override.as_deref(),
        )
    } else {
        resolve(
            RawConfig::default(),
            data_dir_override.as_deref(),
            log_level_override.as_deref(),
        )
    }
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    data_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<ServerConfig, EngineError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| EngineError::Config(format!("config error in {}: {e}", path.display())))?;

    resolve(parsed, data_dir_override, log_level_override)
}

fn resolve(
    raw: RawConfig,
    data_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<ServerConfig, EngineError> {
    let data_dir_str = data_dir_override.unwrap_or(&raw.server.data_dir).to_string();
    let log_level = log_level_override
        .unwrap_or(&raw.server.log_level)
        .to_string();

    // Reject a bad level here, not at first use of the subscriber.
    logger::parse_level(&log_level)?;

    Ok(ServerConfig {
        data_dir: expand_home(&data_dir_str),
        log_level,
        structured_logging: raw.server.structured_logging,
        log_file: raw.server.log_file.map(|p| expand_home(&p)),
        tokenizer: raw.server.tokenizer,
        allow_noncanonical_tool_names: raw.server.allow_noncanonical_tool_names,
        loader: LoaderConfig {
            max_concurrent_loads: raw.loader.max_concurrent_loads.max(1),
            max_file_size_mb: raw.loader.max_file_size_mb.max(1),
        },
        session_defaults: SessionDefaults {
            max_tool_calls: raw.session_defaults.max_tool_calls,
            max_chars_per_response: raw.session_defaults.max_chars_per_response,
            max_chars_per_peek: raw.session_defaults.max_chars_per_peek,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl ServerConfig {
    /// `ServerConfig` rooted at a temp directory — used by unit and
    /// integration tests, which never read a config file.
    pub fn test_default(data_dir: &Path) -> Self {
        ServerConfig {
            data_dir: data_dir.to_path_buf(),
            log_level: "info".into(),
            structured_logging: false,
            log_file: None,
            tokenizer: default_tokenizer(),
            allow_noncanonical_tool_names: false,
            loader: LoaderConfig {
                max_concurrent_loads: 4,
                max_file_size_mb: 2,
            },
            session_defaults: SessionDefaults {
                max_tool_calls: 100,
                max_chars_per_response: 50_000,
                max_chars_per_peek: 8_000,
            },
        }
    }
}

//! Engine-wide error types.
//!
//! The variant set is closed: every failure a tool call can return maps to
//! exactly one kind tag, which travels on the wire next to the message.
//! Domain conditions (not-found, budget, invalid argument) are ordinary
//! variants; only infrastructure faults propagate through `Io`/`Meta`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("session already closed: {0}")]
    SessionAlreadyClosed(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("span not found: {0}")]
    SpanNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("budget exceeded: used {used} of {limit} tool calls")]
    BudgetExceeded { used: u64, limit: u64 },

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("blob missing: {0}")]
    BlobMissing(String),

    #[error("blob corrupt: {0}")]
    BlobCorrupt(String),

    /// Recovered locally by rebuild; never returned to a caller.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("tool naming failure: {0}")]
    ToolNamingFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("meta store error: {0}")]
    Meta(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable kind tag reported on the wire next to the message.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound(_) => "SessionNotFound",
            EngineError::SessionClosed(_) => "SessionClosed",
            EngineError::SessionAlreadyClosed(_) => "SessionAlreadyClosed",
            EngineError::DocumentNotFound(_) => "DocumentNotFound",
            EngineError::SpanNotFound(_) => "SpanNotFound",
            EngineError::ArtifactNotFound(_) => "ArtifactNotFound",
            EngineError::InvalidArgument(_) => "InvalidArgument",
            EngineError::BudgetExceeded { .. } => "BudgetExceeded",
            EngineError::FileTooLarge(_) => "FileTooLarge",
            EngineError::FileNotFound(_) => "FileNotFound",
            EngineError::DecodeError(_) => "DecodeError",
            EngineError::BlobMissing(_) => "BlobMissing",
            EngineError::BlobCorrupt(_) => "BlobCorrupt",
            EngineError::IndexCorrupt(_) => "IndexCorrupt",
            EngineError::ToolNamingFailure(_) => "ToolNamingFailure",
            EngineError::Config(_) => "Config",
            EngineError::Logger(_) => "Logger",
            EngineError::Meta(_) => "Meta",
            EngineError::Io(_) => "Io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn budget_error_carries_counts() {
        let e = EngineError::BudgetExceeded { used: 3, limit: 3 };
        assert!(e.to_string().contains("3 of 3"));
        assert_eq!(e.kind_tag(), "BudgetExceeded");
    }

    #[test]
    fn not_found_display() {
        let e = EngineError::SpanNotFound("sp_x in session abc".into());
        assert!(e.to_string().contains("sp_x"));
        assert_eq!(e.kind_tag(), "SpanNotFound");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: EngineError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }
}

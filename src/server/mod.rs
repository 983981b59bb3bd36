//! Transport boundary — tool-name registration and the stdio serving loop.

pub mod stdio;

use std::collections::HashMap;

use tracing::warn;

use crate::error::EngineError;
use crate::tools::{self, ToolName};

/// Registered method name -> handler, built once at startup.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    by_name: HashMap<String, ToolName>,
}

impl ToolRegistry {
    /// Register every canonical tool name verbatim.  When a name cannot be
    /// registered as-is, startup fails unless
    /// `allow_noncanonical_tool_names` permits falling back to a fabricated
    /// name (one warning is emitted for the whole registry).
    pub fn build(allow_noncanonical: bool) -> Result<ToolRegistry, EngineError> {
        let mut by_name = HashMap::new();
        let mut warned = false;

        for tool in ToolName::ALL {
            let canonical = tool.canonical();
            if tools::name_is_registrable(canonical) {
                by_name.insert(canonical.to_string(), tool);
            } else if allow_noncanonical {
                if !warned {
                    warn!("transport cannot register canonical tool names; falling back to fabricated names");
                    warned = true;
                }
                by_name.insert(tools::fabricated_name(canonical), tool);
            } else {
                return Err(EngineError::ToolNamingFailure(format!(
                    "transport cannot register canonical name '{canonical}' and allow_noncanonical_tool_names is false"
                )));
            }
        }

        Ok(ToolRegistry { by_name })
    }

    pub fn resolve(&self, method: &str) -> Option<ToolName> {
        self.by_name.get(method).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

//! Structured logging bootstrap shared by the binaries

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{PolicyError, Result};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set
    pub level: String,
    /// Log format (json, text)
    pub format: Option<String>,
    /// Include target
    pub include_target: Option<bool>,
    /// Include thread ID
    pub include_thread_id: Option<bool>,
    /// Include line number
    pub include_line_number: Option<bool>,
}

impl LoggingConfig {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: Some("text".to_string()),
            include_target: Some(false),
            include_thread_id: Some(true),
            include_line_number: Some(true),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::with_level("info")
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PolicyError::Config(format!("invalid log filter '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target.unwrap_or(false))
        .with_thread_ids(config.include_thread_id.unwrap_or(true))
        .with_line_number(config.include_line_number.unwrap_or(true));

    let installed = if config.is_json() {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| PolicyError::Config(format!("failed to install tracing subscriber: {}", e)))
}

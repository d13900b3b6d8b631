//! Logging setup, powered by tracing-subscriber
//!
//! Base level plus noisy-crate overrides; `RUST_LOG` replaces both.

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Result, StaveError};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact text: timestamp LEVEL target message
    Compact,
    /// JSON lines
    Json,
}

impl FromStr for LogFormat {
    type Err = StaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" | "jsonl" => Ok(LogFormat::Json),
            other => Err(StaveError::config(format!("unknown log format {:?}", other))),
        }
    }
}

/// Build the filter from the base level and noisy-crate overrides
fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![level.to_string()];

    // Suppress noisy third-party crates
    let noisy: &[(&str, &str)] = &[
        ("hyper", "warn"),
        ("h2", "warn"),
        ("reqwest", "warn"),
        ("tower_http", "info"),
        ("zookeeper_client", "warn"),
    ];
    for (target, lvl) in noisy {
        directives.push(format!("{}={}", target, lvl));
    }

    let filter = directives.join(",");
    EnvFilter::try_new(&filter)
        .map_err(|e| StaveError::config(format!("invalid log filter '{}': {}", filter, e)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let format: LogFormat = config.format.parse()?;
    let filter = build_env_filter(&config.level)?;

    let installed = match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_target(true)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_target(true)
            .with_env_filter(filter)
            .try_init(),
    };

    installed.map_err(|e| StaveError::Internal {
        message: format!("logging already initialized: {}", e),
    })
}

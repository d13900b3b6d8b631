//! Error types for Stave
//!
//! Error taxonomy covering coordination, local version data,
//! serving and configuration failures.

use thiserror::Error;

/// Primary error type for all Stave operations
#[derive(Debug, Error)]
pub enum StaveError {
    // ========== Coordination Errors ==========

    /// Connection to the coordination service was lost
    #[error("Coordination service disconnected: {reason}")]
    CoordinationDisconnected { reason: String },

    /// The coordination session expired
    #[error("Coordination session {session_id} expired")]
    SessionExpired { session_id: u64 },

    /// Could not establish a session
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Reconnect attempts exhausted
    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Path does not exist in the coordination tree
    #[error("No node at {path}")]
    NoNode { path: String },

    /// Path already exists in the coordination tree
    #[error("Node already exists at {path}")]
    NodeExists { path: String },

    /// Node still has children
    #[error("Node {path} has children")]
    NotEmpty { path: String },

    /// Path is not a valid coordination path
    #[error("Invalid coordination path: {path}")]
    InvalidPath { path: String },

    /// The watch for a path was removed
    #[error("Watch on {path} was cancelled")]
    WatchCancelled { path: String },

    /// The watcher has been closed
    #[error("Coordination watcher is closed")]
    WatcherClosed,

    // ========== Version Errors ==========

    /// Version directory exists but is not marked complete
    #[error("Version {version} of {dataset} has no completion marker")]
    PartialVersion { dataset: String, version: String },

    /// A data file contained a malformed record
    #[error("Invalid record in {file} at line {line}")]
    InvalidRecord { file: String, line: usize },

    /// Swap would move the serving version backwards
    #[error("Refusing downgrade from {current} to {proposed}")]
    Downgrade { current: String, proposed: String },

    // ========== Probe Errors ==========

    /// A probe timed out without a definitive answer
    #[error("Probe of {target} timed out")]
    ProbeAmbiguous { target: String },

    // ========== Runtime Errors ==========

    /// Invalid or missing configuration
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StaveError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StaveError::CoordinationDisconnected { .. }
                | StaveError::SessionExpired { .. }
                | StaveError::ConnectionFailed { .. }
        )
    }

    /// Returns true if this error means the session is gone for good
    pub fn is_session_loss(&self) -> bool {
        matches!(self, StaveError::SessionExpired { .. })
    }

    /// Shorthand for a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        StaveError::Config {
            reason: reason.into(),
        }
    }
}

/// Result type alias for Stave operations
pub type Result<T> = std::result::Result<T, StaveError>;

//! Error types for QVM.
//!
//! Command outcomes are values (`CommandResponse`), never errors. `QvmError`
//! covers everything around command execution: configuration, framing,
//! scheduling and persistence.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for QVM operations.
pub type Result<T> = std::result::Result<T, QvmError>;

/// Main error type for QVM.
#[derive(Error, Debug)]
pub enum QvmError {
    // Hypervisor selection
    #[error("Unsupported hypervisor URI '{uri}': {reason}")]
    UnsupportedHypervisor { uri: String, reason: String },

    // Protocol errors
    #[error("Message of {len} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { len: usize, limit: usize },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    // Scheduler errors
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QvmError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap a socket-level error.
    pub fn transport(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

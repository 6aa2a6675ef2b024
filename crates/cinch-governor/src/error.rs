//! Error type for configuration and history validation.
//!
//! Resilience helpers are generic over the caller's own error type; this enum
//! only covers failures the governor itself can detect.

use std::path::PathBuf;

/// Errors raised by the governor's configuration and validation surface.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// The model descriptor has no usable `context` capacity.
    #[error("invalid model configuration: {0}")]
    InvalidModel(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A `tool` message or tool-result part breaks the call/result pairing.
    #[error("invalid history at message {index}: {reason}")]
    InvalidHistory { index: usize, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = GovernorError> = std::result::Result<T, E>;

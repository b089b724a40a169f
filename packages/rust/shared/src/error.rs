//! Error types for the warehouse ingestion subsystem.
//!
//! Library crates use [`WarehouseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all warehouse operations.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed caller input, rejected before any I/O.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The upstream source has no dataset under the requested name.
    #[error("upstream dataset not found: {0}")]
    UpstreamNotFound(String),

    /// The upstream source rejected our credentials.
    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),

    /// Network failure, unexpected status or malformed upstream payload.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// A pull or store call exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The execution was cancelled by a shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The worker pool has no room for another execution.
    #[error("overloaded: {pending} executions already pending")]
    Overloaded { pending: usize },

    /// JSON encoding/decoding of stored documents.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WarehouseError>;

impl WarehouseError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Soft outcomes let an execution complete with an empty result.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::UpstreamNotFound(_))
    }
}

impl From<serde_json::Error> for WarehouseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = WarehouseError::config("missing ERP_PASSWORD");
        assert_eq!(err.to_string(), "config error: missing ERP_PASSWORD");

        let err = WarehouseError::Overloaded { pending: 64 };
        assert!(err.to_string().contains("64 executions"));
    }

    #[test]
    fn only_not_found_is_soft() {
        assert!(WarehouseError::UpstreamNotFound("Weather Data".into()).is_soft());
        assert!(!WarehouseError::UpstreamAuth("401".into()).is_soft());
        assert!(!WarehouseError::UpstreamTransport("reset".into()).is_soft());
        assert!(!WarehouseError::Storage("locked".into()).is_soft());
    }
}

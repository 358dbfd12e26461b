//! Error types for ListingFlow.
//!
//! Two families live here:
//! - [`ListingFlowError`]: infrastructure failures (config, bus, store, I/O).
//!   Library crates return it via the [`Result`] alias; the CLI wraps it with
//!   `color-eyre`.
//! - [`StageError`]: the classified failure a stage capability raises while
//!   processing an envelope. The stage worker routes on its classification
//!   and never re-classifies.

use std::path::PathBuf;

/// Top-level infrastructure error type.
#[derive(Debug, thiserror::Error)]
pub enum ListingFlowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Message bus error (declaration, publish, consume, connection).
    #[error("bus error: {0}")]
    Bus(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Network/HTTP error outside of stage processing.
    #[error("network error: {0}")]
    Network(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad URL, unsupported schema version, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ListingFlowError>;

impl ListingFlowError {
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
}

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// A classified stage failure.
///
/// Capabilities (parsers, fetchers, lookups, the store adapter) pick the
/// variant at the point the failure happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Body could not be decoded into an envelope. Dropped, never stored.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A field this stage requires is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network timeout, temporary content unavailability, and similar.
    #[error("transient error: {0}")]
    Transient(String),

    /// No capability (parser, provider) matches the input.
    #[error("no capability matches: {0}")]
    CapabilityNotFound(String),

    /// The listing store rejected or could not complete a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Permanently invalid input (listing removed, unsupported page).
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl StageError {
    /// Wire name of the classification, used as the dead-letter `reason`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MalformedMessage",
            Self::Validation(_) => "ValidationError",
            Self::Transient(_) => "TransientError",
            Self::CapabilityNotFound(_) => "CapabilityNotFoundError",
            Self::Persistence(_) => "PersistenceError",
            Self::Fatal(_) => "FatalError",
        }
    }

    /// Whether the retry policy may re-submit the envelope.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ListingFlowError::config("missing bus address");
        assert_eq!(err.to_string(), "config error: missing bus address");

        let err = ListingFlowError::validation("schemaVersion 99 not supported");
        assert!(err.to_string().contains("schemaVersion 99"));
    }

    #[test]
    fn stage_error_classification() {
        assert!(StageError::Transient("timeout".into()).is_retryable());
        assert!(StageError::Persistence("locked".into()).is_retryable());
        assert!(!StageError::Validation("no url".into()).is_retryable());
        assert!(!StageError::CapabilityNotFound("x".into()).is_retryable());
        assert!(!StageError::Fatal("gone".into()).is_retryable());

        assert_eq!(
            StageError::CapabilityNotFound("x".into()).kind(),
            "CapabilityNotFoundError"
        );
        assert_eq!(StageError::Validation("x".into()).kind(), "ValidationError");
    }
}

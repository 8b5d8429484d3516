//! Error types for the reconciler
//!
//! This module defines all error types used throughout the crate.
//!
//! Planning errors ([`Error::Validation`], [`Error::CorruptState`]) abort a
//! run before any provider call. Provider errors carry a transient flag that
//! the executor uses to decide whether a retry is worthwhile.

use thiserror::Error;

/// Result type alias for reconciler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the reconciler
#[derive(Error, Debug)]
pub enum Error {
    /// The desired-state graph is invalid (dangling reference, cycle, bad value)
    #[error("Validation error: {message} (resources: {})", resources.join(", "))]
    Validation {
        /// Human readable description
        message: String,
        /// Offending resources, in a stable order
        resources: Vec<String>,
    },

    /// Provider call failed
    #[error("Provider error ({provider}): {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
        /// Whether retrying the same call may succeed
        transient: bool,
    },

    /// The persisted state could not be understood. Requires operator action.
    #[error("Corrupt state at {path}: {message}")]
    CorruptState {
        /// Location of the state document
        path: String,
        /// What went wrong while decoding it
        message: String,
    },

    /// One or more operations failed after retries were exhausted
    #[error(
        "Partial apply: {} committed, {} failed ({}), {} skipped, {} pending",
        committed.len(),
        failed.len(),
        failed.join(", "),
        skipped.len(),
        pending.len()
    )]
    PartialApply {
        /// Resources committed during the run
        committed: Vec<String>,
        /// Resources whose operation failed
        failed: Vec<String>,
        /// Resources skipped because a dependency failed
        skipped: Vec<String>,
        /// Resources never attempted (cancelled run)
        pending: Vec<String>,
    },

    /// Another run holds the state lock
    #[error("State is locked by {holder} since {since}")]
    StateLocked {
        /// Lock holder description
        holder: String,
        /// RFC 3339 acquisition time
        since: String,
    },

    /// State store I/O errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error naming the offending resources
    pub fn validation<I, S>(message: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Validation {
            message: message.into(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a provider error that may succeed when retried
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a provider error that will not succeed when retried
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Create a corrupt state error
    pub fn corrupt_state(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a state store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether retrying the failed call may succeed
    ///
    /// Only provider errors flagged transient and plain I/O errors qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { transient, .. } => *transient,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error must stop the run before any mutation
    pub fn is_planning_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::CorruptState { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("fake", "503").is_transient());
        assert!(!Error::permanent("fake", "400").is_transient());
        assert!(!Error::config("bad").is_transient());
    }

    #[test]
    fn test_validation_message_names_resources() {
        let err = Error::validation("dependency cycle", ["a", "b"]);
        let text = err.to_string();
        assert!(text.contains("dependency cycle"));
        assert!(text.contains("a, b"));
        assert!(err.is_planning_error());
    }
}

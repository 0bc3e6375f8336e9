//! Error types for the mediaflow orchestrator.
//!
//! Stage collaborators report [`StageFailure`], a tagged result that tells the
//! executor whether the failure is worth retrying. Everything else that can go
//! wrong while driving a run is folded into [`PipelineError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::Stage;

/// How a stage failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts and temporary external-tool failures. Retried up to the
    /// configured bound.
    Transient,
    /// Malformed or unexpected external output. Never retried.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A classified failure returned by a stage collaborator.
///
/// The `Display` form is the bare message: the stage name is attached by the
/// executor when the failure is recorded, never by the collaborator or the
/// retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StageFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable failure message.
    pub message: String,
}

impl StageFailure {
    /// Creates a transient (retryable) failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent (non-retryable) failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns true if the failure may succeed on another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl From<std::io::Error> for StageFailure {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                Self::transient(format!("io: {err}"))
            }
            _ => Self::permanent(format!("io: {err}")),
        }
    }
}

/// Errors raised by the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite call failed.
    #[error("state store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `mark_ok` was called for an id that was never marked in progress.
    #[error("item '{0}' has no state record; mark_in_progress must precede mark_ok")]
    UnknownItem(String),

    /// The store's directory could not be created.
    #[error("state store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded.
    #[error("corrupt value in state store: {0}")]
    Corrupt(String),
}

/// Errors raised while loading or validating a run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::RunConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value outside its valid range.
    #[error("invalid config field '{field}': {reason}")]
    Invalid {
        /// Offending field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// The main error type for orchestrator operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The state store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The run configuration was rejected.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The manifest lists an id that cannot be used as a file name.
    #[error("manifest line {line}: unusable item id {id:?}")]
    InvalidItemId {
        /// The offending id.
        id: String,
        /// 1-based line in the manifest.
        line: usize,
    },

    /// The manifest source enumeration failed.
    #[error("manifest source failed: {0}")]
    ManifestSource(StageFailure),

    /// An item failed while fail-fast was enabled.
    #[error("item '{item_id}' failed at stage {stage}: {message}")]
    FailFast {
        /// The failing item.
        item_id: String,
        /// The stage that was running.
        stage: Stage,
        /// Bounded failure message.
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for results in this crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_display_is_bare_message() {
        let failure = StageFailure::transient("socket timed out");
        assert_eq!(failure.to_string(), "socket timed out");
        assert!(failure.is_transient());
    }

    #[test]
    fn test_permanent_failure_not_transient() {
        let failure = StageFailure::permanent("unexpected output");
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(!failure.is_transient());
    }

    #[test]
    fn test_io_error_classification() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(StageFailure::from(timeout).is_transient());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!StageFailure::from(missing).is_transient());
    }

    #[test]
    fn test_fail_fast_message() {
        let err = PipelineError::FailFast {
            item_id: "abc".to_string(),
            stage: Stage::Acquire,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "item 'abc' failed at stage acquire: boom");
    }

    #[test]
    fn test_unknown_item_message() {
        let err = StoreError::UnknownItem("x".to_string());
        assert!(err.to_string().contains("'x'"));
    }
}

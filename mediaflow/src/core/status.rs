//! Item status and stage enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::StoreError;

/// A named step in an item's fixed processing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Recorded when processing of an item begins, before any stage runs.
    Start,
    /// Fetch descriptive metadata for the source.
    Metadata,
    /// Acquire the raw media.
    Acquire,
    /// Transform the raw media into the compute input format.
    Transform,
    /// Primary compute (e.g. speech-to-text).
    PrimaryCompute,
    /// Secondary compute (e.g. speaker diarization).
    SecondaryCompute,
    /// Persist the final artifact.
    Persist,
}

impl Stage {
    /// The stages executed for every item, in order.
    pub const SEQUENCE: [Self; 6] = [
        Self::Metadata,
        Self::Acquire,
        Self::Transform,
        Self::PrimaryCompute,
        Self::SecondaryCompute,
        Self::Persist,
    ];

    /// The label used in the state store, events and artifacts.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Metadata => "metadata",
            Self::Acquire => "acquire",
            Self::Transform => "transform",
            Self::PrimaryCompute => "primary_compute",
            Self::SecondaryCompute => "secondary_compute",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable processing status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Known but not yet attempted.
    Pending,
    /// Processing started and has not durably finished.
    InProgress,
    /// Processing finished successfully.
    Ok,
    /// Processing finished with a recorded failure.
    Failed,
}

impl Default for ItemStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ItemStatus {
    /// The label stored in the state store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    /// Returns true if the status is terminal (`finished_at` is set).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!("unknown status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Start.to_string(), "start");
        assert_eq!(Stage::PrimaryCompute.to_string(), "primary_compute");
        assert_eq!(Stage::SecondaryCompute.to_string(), "secondary_compute");
    }

    #[test]
    fn test_sequence_order() {
        assert_eq!(Stage::SEQUENCE.first(), Some(&Stage::Metadata));
        assert_eq!(Stage::SEQUENCE.last(), Some(&Stage::Persist));
        assert!(!Stage::SEQUENCE.contains(&Stage::Start));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::InProgress,
            ItemStatus::Ok,
            ItemStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("done".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(ItemStatus::Ok.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::InProgress.is_terminal());
        assert!(!ItemStatus::Pending.is_terminal());
    }

    #[test]
    fn test_stage_serialize() {
        let json = serde_json::to_string(&Stage::SecondaryCompute).unwrap();
        assert_eq!(json, r#""secondary_compute""#);
    }
}

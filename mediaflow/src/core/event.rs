//! Progress event records written to the append-only event log.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Processing of an item started.
    Start,
    /// An item finished successfully.
    Ok,
    /// An item finished with a recorded failure.
    Failed,
    /// Something unexpected but non-fatal happened.
    Warn,
    /// Run-level informational message.
    Info,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Ok => write!(f, "ok"),
            Self::Failed => write!(f, "failed"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// One line of the event log. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event occurred (ISO 8601, UTC).
    pub ts: String,

    /// The run that produced the event.
    pub run_id: Uuid,

    /// The item concerned, absent for run-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,

    /// The event kind.
    pub kind: EventKind,

    /// Optional human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Free-form structured fields.
    #[serde(default, flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(run_id: Uuid, kind: EventKind) -> Self {
        Self {
            ts: crate::utils::iso_timestamp(),
            run_id,
            item_id: None,
            kind,
            msg: None,
            fields: serde_json::Map::new(),
        }
    }

    /// Sets the item id.
    #[must_use]
    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    /// Adds a structured field.
    #[must_use]
    pub fn add_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Serializes the event as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

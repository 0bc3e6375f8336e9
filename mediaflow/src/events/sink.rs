//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::{Event, EventKind};

/// Receives progress events.
///
/// Sinks never fail the run: write errors are logged and suppressed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event.
    async fn emit(&self, event: &Event);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &Event) {}
}

/// Appends events as JSON lines to a file.
///
/// Each event is written and flushed as one complete line, so a crash can at
/// worst lose the last event, never interleave two.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventSink {
    /// Opens `path` for appending, creating it and its parent directories.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &Event) {
        let line = match event.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
            warn!(path = %self.path.display(), error = %e, "failed to append event");
        }
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn emit(&self, event: &Event) {
        self.append(event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<Event>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the item ids of events of one kind, in emission order.
    #[must_use]
    pub fn item_ids(&self, kind: EventKind) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.item_id.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &Event) {
        self.events.write().push(event.clone());
    }
}

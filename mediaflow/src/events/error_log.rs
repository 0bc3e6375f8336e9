//! Human-readable failure log.

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::core::{Item, Stage};
use crate::utils::{iso_timestamp, tail};

/// Maximum characters of failure text written per block.
pub const ERROR_LOG_LIMIT: usize = 8000;

/// Appends one block per failed item:
///
/// ```text
/// [<ts>] <id> <reference>
/// STAGE=<stage>
/// <message>
///
/// ```
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ErrorLog {
    /// Creates a log writing to `path`. The file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a failure block.
    pub fn append(&self, item: &Item, stage: Stage, message: &str) -> io::Result<()> {
        let block = format!(
            "[{}] {} {}\nSTAGE={}\n{}\n\n",
            iso_timestamp(),
            item.id,
            item.reference,
            stage,
            tail(message, ERROR_LOG_LIMIT)
        );

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(block.as_bytes())?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("errors.log"));
        let item = Item::new("b", "https://example.com/b");

        log.append(&item, Stage::Acquire, "HTTP 403").unwrap();
        log.append(&item, Stage::Persist, "disk full").unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let blocks: Vec<&str> = text.split("\n\n").filter(|b| !b.is_empty()).collect();
        assert_eq!(blocks.len(), 2);

        let lines: Vec<&str> = blocks[0].lines().collect();
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] b https://example.com/b"));
        assert_eq!(lines[1], "STAGE=acquire");
        assert_eq!(lines[2], "HTTP 403");
    }

    #[test]
    fn test_message_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("errors.log"));
        let item = Item::new("x", "ref");

        let message = format!("{}END", "y".repeat(ERROR_LOG_LIMIT * 2));
        log.append(&item, Stage::Transform, &message).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.len() < ERROR_LOG_LIMIT + 200);
        assert!(text.contains("END\n\n"));
    }
}

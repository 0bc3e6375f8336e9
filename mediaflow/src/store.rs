//! Durable per-item state ledger backed by SQLite.
//!
//! The store is the single source of truth for resume decisions. Every
//! mutating call is a single auto-committed statement, so when a call returns
//! its effect is on disk and a crash can never leave half of it applied. The
//! database runs in WAL mode with `synchronous=FULL`.
//!
//! Only one process may write to a store at a time.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::core::{ItemStatus, Stage};
use crate::errors::StoreError;
use crate::utils::{iso_timestamp, tail};

/// Maximum characters of error text kept per item.
pub const STORE_ERROR_LIMIT: usize = 8000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    item_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_stage TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    started_at TEXT,
    finished_at TEXT,
    duration_seconds REAL,
    output_metric INTEGER
);
CREATE TABLE IF NOT EXISTS meta (
    k TEXT PRIMARY KEY,
    v TEXT
);
";

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Item identifier.
    pub id: String,
    /// Current status.
    pub status: ItemStatus,
    /// Label of the stage last attempted.
    pub last_stage: Option<String>,
    /// Number of processing attempts recorded.
    pub attempts: u32,
    /// Bounded text of the last failure.
    pub last_error: Option<String>,
    /// When the latest attempt started.
    pub started_at: Option<String>,
    /// When the latest attempt finished; set iff status is terminal.
    pub finished_at: Option<String>,
    /// Wall time of the latest successful attempt.
    pub duration_seconds: Option<f64>,
    /// Output metric of the latest successful attempt (word count).
    pub output_metric: Option<u64>,
}

impl ItemRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<(Self, String)> {
        let status: String = row.get("status")?;
        let attempts: i64 = row.get("attempts")?;
        let metric: Option<i64> = row.get("output_metric")?;
        Ok((
            Self {
                id: row.get("item_id")?,
                status: ItemStatus::Pending,
                last_stage: row.get("last_stage")?,
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                last_error: row.get("last_error")?,
                started_at: row.get("started_at")?,
                finished_at: row.get("finished_at")?,
                duration_seconds: row.get("duration_seconds")?,
                output_metric: metric.and_then(|m| u64::try_from(m).ok()),
            },
            status,
        ))
    }
}

/// Number of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Items never attempted.
    pub pending: u64,
    /// Items started but not finished.
    pub in_progress: u64,
    /// Items finished successfully.
    pub ok: u64,
    /// Items finished with a failure.
    pub failed: u64,
}

/// The durable state ledger.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened state store");
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    /// Opens a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the status of `id`, or `None` if it has never been recorded.
    pub fn status_of(&self, id: &str) -> Result<Option<ItemStatus>, StoreError> {
        let status: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT status FROM items WHERE item_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    /// Returns the full record for `id`.
    pub fn get(&self, id: &str) -> Result<Option<ItemRecord>, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT * FROM items WHERE item_id = ?1",
                params![id],
                ItemRecord::from_row,
            )
            .optional()?;
        row.map(|(mut record, status)| -> Result<ItemRecord, StoreError> {
            record.status = status.parse()?;
            Ok(record)
        })
        .transpose()
    }

    /// Starts an attempt: upserts the row as `in_progress`, bumps `attempts`
    /// (1 for a new row), stamps `started_at` and clears `finished_at`.
    pub fn mark_in_progress(&self, id: &str, stage: Stage) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO items (item_id, status, last_stage, attempts, started_at)
             VALUES (?1, 'in_progress', ?2, 1, ?3)
             ON CONFLICT(item_id) DO UPDATE SET
                status = 'in_progress',
                last_stage = excluded.last_stage,
                attempts = items.attempts + 1,
                started_at = excluded.started_at,
                finished_at = NULL",
            params![id, stage.as_str(), iso_timestamp()],
        )?;
        debug!(item_id = id, stage = %stage, "marked in progress");
        Ok(())
    }

    /// Records the stage now running for an in-progress item.
    pub fn mark_stage(&self, id: &str, stage: Stage) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE items SET last_stage = ?2 WHERE item_id = ?1 AND status = 'in_progress'",
            params![id, stage.as_str()],
        )?;
        Ok(())
    }

    /// Finishes an attempt successfully.
    ///
    /// The row must already exist; calling this for an unknown id is a
    /// programming error reported as [`StoreError::UnknownItem`].
    pub fn mark_ok(&self, id: &str, duration_seconds: f64, metric: u64) -> Result<(), StoreError> {
        let metric = i64::try_from(metric).unwrap_or(i64::MAX);
        let changed = self.conn.lock().execute(
            "UPDATE items SET status = 'ok', finished_at = ?2, duration_seconds = ?3,
                output_metric = ?4, last_error = NULL
             WHERE item_id = ?1",
            params![id, iso_timestamp(), duration_seconds, metric],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownItem(id.to_string()));
        }
        debug!(item_id = id, duration_seconds, metric, "marked ok");
        Ok(())
    }

    /// Finishes an attempt with a failure. Upserts, bumps `attempts` and keeps
    /// at most [`STORE_ERROR_LIMIT`] trailing characters of `error`.
    pub fn mark_failed(&self, id: &str, stage: Stage, error: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO items (item_id, status, last_stage, attempts, last_error, finished_at)
             VALUES (?1, 'failed', ?2, 1, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET
                status = 'failed',
                last_stage = excluded.last_stage,
                attempts = items.attempts + 1,
                last_error = excluded.last_error,
                finished_at = excluded.finished_at",
            params![id, stage.as_str(), tail(error, STORE_ERROR_LIMIT), iso_timestamp()],
        )?;
        debug!(item_id = id, stage = %stage, "marked failed");
        Ok(())
    }

    /// Returns the recorded manifest size.
    pub fn get_total(&self) -> Result<Option<u64>, StoreError> {
        let value: Option<Option<String>> = self
            .conn
            .lock()
            .query_row("SELECT v FROM meta WHERE k = 'total'", [], |row| row.get(0))
            .optional()?;
        Ok(value.flatten().and_then(|v| v.parse().ok()))
    }

    /// Records the manifest size.
    pub fn set_total(&self, total: u64) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO meta (k, v) VALUES ('total', ?1)",
            params![total.to_string()],
        )?;
        Ok(())
    }

    /// Counts items per status.
    pub fn counts(&self) -> Result<StatusCounts, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM items GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<ItemStatus>()? {
                ItemStatus::Pending => counts.pending += n,
                ItemStatus::InProgress => counts.in_progress += n,
                ItemStatus::Ok => counts.ok += n,
                ItemStatus::Failed => counts.failed += n,
            }
        }
        Ok(counts)
    }

    /// Lists ids with the given status, in id order.
    pub fn ids_with_status(&self, status: ItemStatus) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT item_id FROM items WHERE status = ?1 ORDER BY item_id")?;
        let ids = stmt
            .query_map(params![status.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_unknown_item_has_no_status() {
        let store = store();
        assert_eq!(store.status_of("nope").unwrap(), None);
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_mark_in_progress_upserts() {
        let store = store();
        store.mark_in_progress("a", Stage::Start).unwrap();

        let record = store.get("a").unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::InProgress);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_stage.as_deref(), Some("start"));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_none());

        store.mark_in_progress("a", Stage::Start).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().attempts, 2);
    }

    #[test]
    fn test_mark_ok_lifecycle() {
        let store = store();
        store.mark_in_progress("a", Stage::Start).unwrap();
        store.mark_stage("a", Stage::Transform).unwrap();
        store.mark_ok("a", 12.5, 300).unwrap();

        let record = store.get("a").unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Ok);
        assert_eq!(record.last_stage.as_deref(), Some("transform"));
        assert_eq!(record.duration_seconds, Some(12.5));
        assert_eq!(record.output_metric, Some(300));
        assert!(record.finished_at.is_some());
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_mark_ok_requires_existing_record() {
        let store = store();
        let err = store.mark_ok("ghost", 1.0, 0).unwrap_err();
        assert!(matches!(err, StoreError::UnknownItem(id) if id == "ghost"));
    }

    #[test]
    fn test_mark_failed_upserts_and_truncates() {
        let store = store();
        let long = format!("{}END", "x".repeat(STORE_ERROR_LIMIT));
        store.mark_failed("b", Stage::Acquire, &long).unwrap();

        let record = store.get("b").unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_stage.as_deref(), Some("acquire"));
        let stored = record.last_error.unwrap();
        assert_eq!(stored.chars().count(), STORE_ERROR_LIMIT);
        assert!(stored.ends_with("END"));
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_retry_after_failure_clears_finished_at() {
        let store = store();
        store.mark_in_progress("c", Stage::Start).unwrap();
        store.mark_failed("c", Stage::Transform, "boom").unwrap();
        assert_eq!(store.get("c").unwrap().unwrap().attempts, 2);

        store.mark_in_progress("c", Stage::Start).unwrap();
        let record = store.get("c").unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::InProgress);
        assert_eq!(record.attempts, 3);
        assert!(record.finished_at.is_none());

        store.mark_ok("c", 1.0, 5).unwrap();
        let record = store.get("c").unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Ok);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_mark_stage_ignores_finished_items() {
        let store = store();
        store.mark_failed("d", Stage::Acquire, "x").unwrap();
        store.mark_stage("d", Stage::Persist).unwrap();
        assert_eq!(store.get("d").unwrap().unwrap().last_stage.as_deref(), Some("acquire"));
    }

    #[test]
    fn test_total_metadata() {
        let store = store();
        assert_eq!(store.get_total().unwrap(), None);
        store.set_total(42).unwrap();
        assert_eq!(store.get_total().unwrap(), Some(42));
        store.set_total(7).unwrap();
        assert_eq!(store.get_total().unwrap(), Some(7));
    }

    #[test]
    fn test_counts_and_listing() {
        let store = store();
        store.mark_in_progress("a", Stage::Start).unwrap();
        store.mark_ok("a", 1.0, 1).unwrap();
        store.mark_in_progress("b", Stage::Start).unwrap();
        store.mark_failed("c", Stage::Acquire, "x").unwrap();

        assert_eq!(
            store.counts().unwrap(),
            StatusCounts {
                pending: 0,
                in_progress: 1,
                ok: 1,
                failed: 1,
            }
        );
        assert_eq!(store.ids_with_status(ItemStatus::InProgress).unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/state.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.mark_in_progress("a", Stage::Start).unwrap();
            store.set_total(3).unwrap();
            // Dropped without any explicit close or flush.
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.status_of("a").unwrap(), Some(ItemStatus::InProgress));
        assert_eq!(store.get_total().unwrap(), Some(3));
    }
}

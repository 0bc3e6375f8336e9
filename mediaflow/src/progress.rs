//! Run progress accounting and reporting.
//!
//! [`ProgressReporter`] is the single place the executor reports to. Every
//! event goes to the durable [`EventSink`] and is mirrored as a `tracing` line
//! whose level follows the event kind. Counters live in [`ProgressStats`];
//! how they are shown is up to the [`Reporter`] chosen at construction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::{Event, EventKind};
use crate::events::EventSink;
use crate::utils::tail;

/// Maximum characters of message text carried by one event.
pub const EVENT_MESSAGE_LIMIT: usize = 500;

/// Number of recent item durations kept for the moving average.
pub const DURATION_WINDOW: usize = 30;

/// Counters for one run.
#[derive(Debug, Clone)]
pub struct ProgressStats {
    started: Instant,
    total: u64,
    ok: u64,
    failed: u64,
    skipped: u64,
    window: VecDeque<f64>,
}

impl ProgressStats {
    /// Starts counting a run of `total` items.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
            ok: 0,
            failed: 0,
            skipped: 0,
            window: VecDeque::with_capacity(DURATION_WINDOW),
        }
    }

    /// Records a successful item and its wall time.
    pub fn record_ok(&mut self, duration_seconds: f64) {
        self.ok += 1;
        self.push_duration(duration_seconds);
    }

    /// Records a failed item and its wall time.
    pub fn record_failed(&mut self, duration_seconds: f64) {
        self.failed += 1;
        self.push_duration(duration_seconds);
    }

    fn push_duration(&mut self, duration_seconds: f64) {
        if self.window.len() == DURATION_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(duration_seconds);
    }

    /// Records a skipped item.
    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Items expected in this run.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Successful items.
    #[must_use]
    pub fn ok(&self) -> u64 {
        self.ok
    }

    /// Failed items.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Skipped items.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Items accounted for so far.
    #[must_use]
    pub fn done(&self) -> u64 {
        self.ok + self.failed + self.skipped
    }

    /// Items not yet accounted for.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.done())
    }

    /// Time since the run started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Mean duration of the last [`DURATION_WINDOW`] processed items, or 0.
    #[must_use]
    pub fn moving_average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Successful items per minute since the run started.
    #[must_use]
    pub fn throughput_per_minute(&self) -> f64 {
        let minutes = self.elapsed().as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.ok as f64 / minutes
        } else {
            0.0
        }
    }

    /// Estimated time to finish, unknown until an item has been processed.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let avg = self.moving_average();
        (avg > 0.0).then(|| Duration::from_secs_f64(avg * self.remaining() as f64))
    }
}

/// Display strategy for progress.
pub trait Reporter: Send + Sync {
    /// Called before an item is considered.
    fn item_started(&self, index: u64, item_id: &str, stats: &ProgressStats);

    /// Called once the loop ends.
    fn run_finished(&self, stats: &ProgressStats);
}

/// Reporter that shows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReporter;

impl Reporter for NoOpReporter {
    fn item_started(&self, _index: u64, _item_id: &str, _stats: &ProgressStats) {}
    fn run_finished(&self, _stats: &ProgressStats) {}
}

/// Reporter that writes one `tracing` line per item.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReporter;

impl Reporter for LoggingReporter {
    fn item_started(&self, index: u64, item_id: &str, stats: &ProgressStats) {
        info!(
            index,
            total = stats.total(),
            item_id,
            ok = stats.ok(),
            failed = stats.failed(),
            skipped = stats.skipped(),
            avg_seconds = format_args!("{:.1}", stats.moving_average()),
            per_minute = format_args!("{:.1}", stats.throughput_per_minute()),
            "[{index}/{}] {item_id}",
            stats.total()
        );
    }

    fn run_finished(&self, stats: &ProgressStats) {
        info!(
            ok = stats.ok(),
            failed = stats.failed(),
            skipped = stats.skipped(),
            elapsed_seconds = stats.elapsed().as_secs(),
            "run finished"
        );
    }
}

/// Routes executor events to the event sink, `tracing` and a [`Reporter`].
pub struct ProgressReporter {
    run_id: Uuid,
    sink: Arc<dyn EventSink>,
    reporter: Arc<dyn Reporter>,
    stats: ProgressStats,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("run_id", &self.run_id)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a reporter for one run.
    #[must_use]
    pub fn new(run_id: Uuid, sink: Arc<dyn EventSink>, reporter: Arc<dyn Reporter>, total: u64) -> Self {
        Self {
            run_id,
            sink,
            reporter,
            stats: ProgressStats::new(total),
        }
    }

    /// The run this reporter belongs to.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> &ProgressStats {
        &self.stats
    }

    /// Mutable counters.
    pub fn stats_mut(&mut self) -> &mut ProgressStats {
        &mut self.stats
    }

    /// Appends one event and mirrors it to `tracing`.
    pub async fn log_event(
        &self,
        kind: EventKind,
        item_id: Option<&str>,
        msg: Option<&str>,
        fields: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut event = Event::new(self.run_id, kind);
        event.item_id = item_id.map(str::to_string);
        event.msg = msg.map(|m| tail(m, EVENT_MESSAGE_LIMIT).to_string());
        event.fields = fields;

        let id = item_id.unwrap_or("-");
        let text = event.msg.as_deref().unwrap_or("");
        match kind {
            EventKind::Failed => error!(item_id = id, kind = %kind, "{text}"),
            EventKind::Warn => warn!(item_id = id, kind = %kind, "{text}"),
            EventKind::Start | EventKind::Ok | EventKind::Info => {
                info!(item_id = id, kind = %kind, "{text}");
            }
        }

        self.sink.emit(&event).await;
    }

    /// Notifies the display strategy that item `index` is next.
    pub fn item_started(&self, index: u64, item_id: &str) {
        self.reporter.item_started(index, item_id, &self.stats);
    }

    /// Notifies the display strategy that the loop ended.
    pub fn run_finished(&self) {
        self.reporter.run_finished(&self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use serde_json::json;

    #[test]
    fn test_counters() {
        let mut stats = ProgressStats::new(5);
        stats.record_ok(2.0);
        stats.record_failed(4.0);
        stats.record_skipped();

        assert_eq!(stats.done(), 3);
        assert_eq!(stats.remaining(), 2);
        assert!((stats.moving_average() - 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.eta(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut stats = ProgressStats::new(100);
        for _ in 0..DURATION_WINDOW {
            stats.record_ok(100.0);
        }
        for _ in 0..DURATION_WINDOW {
            stats.record_ok(1.0);
        }
        assert!((stats.moving_average() - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.ok(), 2 * DURATION_WINDOW as u64);
    }

    #[test]
    fn test_eta_unknown_before_first_item() {
        let mut stats = ProgressStats::new(3);
        stats.record_skipped();
        assert_eq!(stats.eta(), None);
        assert!(stats.throughput_per_minute().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_log_event_bounds_message_and_keeps_fields() {
        let sink = Arc::new(CollectingEventSink::new());
        let run_id = Uuid::new_v4();
        let reporter = ProgressReporter::new(run_id, sink.clone(), Arc::new(NoOpReporter), 1);

        let long = format!("{}tail", "z".repeat(EVENT_MESSAGE_LIMIT));
        let mut fields = serde_json::Map::new();
        fields.insert("stage".to_string(), json!("acquire"));
        reporter
            .log_event(EventKind::Failed, Some("a"), Some(&long), fields)
            .await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.run_id, run_id);
        assert_eq!(event.item_id.as_deref(), Some("a"));
        let msg = event.msg.as_deref().unwrap();
        assert_eq!(msg.chars().count(), EVENT_MESSAGE_LIMIT);
        assert!(msg.ends_with("tail"));
        assert_eq!(event.fields["stage"], "acquire");
    }

    /// Collects formatted log lines written by a test subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
            let logs = self.clone();
            tracing_subscriber::fmt()
                .with_writer(move || logs.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .finish()
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_log_event_level_follows_kind() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let reporter = ProgressReporter::new(
            Uuid::new_v4(),
            Arc::new(CollectingEventSink::new()),
            Arc::new(NoOpReporter),
            1,
        );
        reporter
            .log_event(EventKind::Failed, Some("vid1"), Some("decoder crashed"), serde_json::Map::new())
            .await;
        reporter
            .log_event(EventKind::Warn, Some("vid2"), Some("metadata unavailable"), serde_json::Map::new())
            .await;

        let text = logs.text();
        let failed = text.lines().find(|l| l.contains("decoder crashed")).unwrap();
        assert!(failed.contains("ERROR"));
        assert!(failed.contains("vid1"));
        let warned = text.lines().find(|l| l.contains("metadata unavailable")).unwrap();
        assert!(warned.contains("WARN"));
    }

    #[test]
    fn test_logging_reporter_writes_progress_lines() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let mut stats = ProgressStats::new(2);
        stats.record_ok(1.5);
        LoggingReporter.item_started(2, "vid2", &stats);
        LoggingReporter.run_finished(&stats);
        NoOpReporter.item_started(1, "silent", &stats);

        let text = logs.text();
        assert!(text.contains("INFO"));
        assert!(text.contains("[2/2] vid2"));
        assert!(text.contains("run finished"));
        assert!(!text.contains("silent"));
    }
}

//! Run loop and per-item state machine.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::collaborators::{SecondaryOutput, StageCollaborators};
use super::work_area::WorkArea;
use crate::atomic::write_atomic;
use crate::cancellation::{CancellationToken, ShutdownCoordinator};
use crate::config::{RunConfig, SkipPolicy};
use crate::core::{Artifact, EventKind, Item, ItemStatus, Stage};
use crate::errors::{PipelineError, Result, StageFailure, StoreError};
use crate::events::{ErrorLog, EventSink, JsonlEventSink};
use crate::manifest::{Manifest, ManifestBuilder};
use crate::progress::{LoggingReporter, ProgressReporter, Reporter};
use crate::retry::{random_jitter, secs_to_duration, with_retry};
use crate::store::StateStore;
use crate::utils::word_count;

/// Why an item was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A valid success artifact already exists.
    ValidArtifact,
    /// The store records the item as done.
    AlreadyOk,
    /// The store records a failure and failed items are not retried.
    AlreadyFailed,
}

/// Where an item is in its lifecycle within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    /// Not processed in this run.
    Skipped(SkipReason),
    /// A stage is running.
    InProgress(Stage),
    /// Every stage succeeded and the store says `ok`.
    Completed,
    /// The item failed durably at a stage.
    FailedAt(Stage),
}

impl fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped({reason:?})"),
            Self::InProgress(stage) => write!(f, "in_progress({stage})"),
            Self::Completed => write!(f, "completed"),
            Self::FailedAt(stage) => write!(f, "failed_at({stage})"),
        }
    }
}

/// Totals for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Identifier stamped on every event of the run.
    pub run_id: Uuid,
    /// Items that completed in this run.
    pub ok: u64,
    /// Items that failed in this run.
    pub failed: u64,
    /// Items skipped because they were already finished.
    pub skipped: u64,
    /// Items the run was expected to cover.
    pub total: u64,
    /// The run stopped early because shutdown was requested.
    pub cancelled: bool,
    /// Wall time.
    pub elapsed: Duration,
}

/// Why the stage sequence stopped.
enum Abort {
    /// A stage failed; the item is recorded as failed and the run goes on.
    Stage(Stage, StageFailure),
    /// The orchestrator itself broke; the run stops.
    Fatal(PipelineError),
}

impl From<StoreError> for Abort {
    fn from(err: StoreError) -> Self {
        Self::Fatal(err.into())
    }
}

/// Output of a successful stage sequence, ready to persist.
struct Completed {
    artifact: Artifact,
    words: u64,
}

/// Drives one run over a manifest.
pub struct Runner {
    config: RunConfig,
    collaborators: Arc<dyn StageCollaborators>,
    token: Arc<CancellationToken>,
    reporter: Arc<dyn Reporter>,
    sink: Option<Arc<dyn EventSink>>,
    store: Option<Arc<StateStore>>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a runner that logs progress and appends events to
    /// `<state>/events.jsonl`.
    #[must_use]
    pub fn new(config: RunConfig, collaborators: Arc<dyn StageCollaborators>) -> Self {
        Self {
            config,
            collaborators,
            token: Arc::new(CancellationToken::new()),
            reporter: Arc::new(LoggingReporter),
            sink: None,
            store: None,
        }
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Uses a different progress display.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sends events to `sink` instead of the JSONL log.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Uses an already opened store instead of `<state>/state.db`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The token checked between items.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Returns the state store, opening it on first use.
    pub fn store(&mut self) -> Result<Arc<StateStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(StateStore::open(self.config.store_path())?);
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Builds (or reuses) the manifest at `<state>/manifest.txt` from `source`,
    /// honouring the configured limit and rebuild flag.
    pub async fn build_manifest<S>(&mut self, source: S) -> Result<Manifest>
    where
        S: futures::Stream<Item = std::result::Result<String, StageFailure>>,
    {
        let store = self.store()?;
        ManifestBuilder::new(self.config.manifest_path())
            .with_limit(self.config.limit)
            .with_force_rebuild(self.config.rebuild_manifest)
            .build(source, &store)
            .await
    }

    /// Processes every entry of the manifest at `manifest_path`.
    ///
    /// Returns the run totals, including when the run stopped early on a
    /// shutdown request. Fails with [`PipelineError::FailFast`] on the first
    /// item failure when fail-fast is enabled, and with a store error if the
    /// ledger cannot be updated.
    pub async fn run(&mut self, manifest_path: impl AsRef<Path>) -> Result<RunSummary> {
        self.config.validate()?;
        let store = self.store()?;
        let sink: Arc<dyn EventSink> = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => Arc::new(JsonlEventSink::open(self.config.events_path())?),
        };

        let manifest = Manifest::load(manifest_path)?;
        let mut total = manifest.ensure_total(&store)?;
        if self.config.limit > 0 {
            total = total.min(self.config.limit);
        }

        let run_id = Uuid::new_v4();
        let mut progress = ProgressReporter::new(run_id, sink, Arc::clone(&self.reporter), total);
        let error_log = ErrorLog::new(self.config.error_log_path());
        progress
            .log_event(
                EventKind::Info,
                None,
                Some("run started"),
                fields([("total", json!(total)), ("manifest", json!(manifest.path().display().to_string()))]),
            )
            .await;

        let mut cancelled = false;
        for (position, id) in manifest.ids().iter().enumerate() {
            let index = position as u64 + 1;
            if self.config.limit > 0 && index > self.config.limit {
                break;
            }
            progress.item_started(index, id);

            let item = Item::from_template(id.as_str(), &self.config.reference_template);
            let Some(phase) = self
                .process_item(&item, index, &store, &error_log, &mut progress)
                .await?
            else {
                cancelled = true;
                break;
            };
            debug!(item_id = %item.id, phase = %phase, "item done");

            if !matches!(phase, ItemPhase::Skipped(_)) && !self.token.is_cancelled() {
                self.pause().await;
            }
            if self.token.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            let reason = self.token.reason().unwrap_or_default();
            progress
                .log_event(
                    EventKind::Warn,
                    None,
                    Some("stop requested; exiting after current progress"),
                    fields([("reason", json!(reason))]),
                )
                .await;
        }

        let stats = progress.stats();
        let summary = RunSummary {
            run_id,
            ok: stats.ok(),
            failed: stats.failed(),
            skipped: stats.skipped(),
            total,
            cancelled,
            elapsed: stats.elapsed(),
        };
        progress
            .log_event(
                EventKind::Info,
                None,
                Some("run finished"),
                fields([
                    ("ok", json!(summary.ok)),
                    ("failed", json!(summary.failed)),
                    ("skipped", json!(summary.skipped)),
                    ("cancelled", json!(summary.cancelled)),
                ]),
            )
            .await;
        progress.run_finished();
        Ok(summary)
    }

    /// Returns `None` if the run must stop before this item.
    async fn process_item(
        &self,
        item: &Item,
        index: u64,
        store: &StateStore,
        error_log: &ErrorLog,
        progress: &mut ProgressReporter,
    ) -> Result<Option<ItemPhase>> {
        if let Some(reason) = self.skip_reason(item, store)? {
            debug!(item_id = %item.id, ?reason, "skipping");
            progress.stats_mut().record_skipped();
            return Ok(Some(ItemPhase::Skipped(reason)));
        }
        if self.token.is_cancelled() {
            return Ok(None);
        }

        let started = Instant::now();
        store.mark_in_progress(&item.id, Stage::Start)?;
        progress
            .log_event(
                EventKind::Start,
                Some(&item.id),
                None,
                fields([("i", json!(index)), ("n", json!(progress.stats().total()))]),
            )
            .await;

        let outcome = match WorkArea::acquire(&self.config.work_dir, &item.id, self.config.keep_work_dirs) {
            Ok(work) => {
                let outcome = self.run_stages(item, work.path(), store, progress).await;
                match outcome {
                    Ok(completed) => self.persist(item, completed, started, store).await,
                    Err(abort) => Err(abort),
                }
                // `work` dropped here, before the failure is recorded.
            }
            Err(e) => Err(Abort::Stage(Stage::Start, StageFailure::from(e))),
        };

        let seconds = started.elapsed().as_secs_f64();
        match outcome {
            Ok(words) => {
                progress.stats_mut().record_ok(seconds);
                progress
                    .log_event(
                        EventKind::Ok,
                        Some(&item.id),
                        None,
                        fields([("seconds", json!(round3(seconds))), ("words", json!(words))]),
                    )
                    .await;
                Ok(Some(ItemPhase::Completed))
            }
            Err(Abort::Fatal(err)) => Err(err),
            Err(Abort::Stage(stage, failure)) => {
                self.record_failure(item, stage, &failure, store, error_log)?;
                progress.stats_mut().record_failed(seconds);
                progress
                    .log_event(
                        EventKind::Failed,
                        Some(&item.id),
                        Some(&failure.message),
                        fields([
                            ("stage", json!(stage)),
                            ("seconds", json!(round3(seconds))),
                            ("transient", json!(failure.is_transient())),
                        ]),
                    )
                    .await;
                if self.config.fail_fast {
                    return Err(PipelineError::FailFast {
                        item_id: item.id.clone(),
                        stage,
                        message: crate::utils::tail(&failure.message, crate::store::STORE_ERROR_LIMIT)
                            .to_string(),
                    });
                }
                Ok(Some(ItemPhase::FailedAt(stage)))
            }
        }
    }

    fn skip_reason(&self, item: &Item, store: &StateStore) -> Result<Option<SkipReason>> {
        if self.config.retry_failed {
            return Ok(None);
        }
        if self.config.skip_policy == SkipPolicy::ArtifactFirst
            && self
                .collaborators
                .has_valid_artifact(&self.config.artifact_path(&item.id), &self.config.out_dir)
        {
            return Ok(Some(SkipReason::ValidArtifact));
        }
        Ok(match store.status_of(&item.id)? {
            Some(ItemStatus::Ok) => Some(SkipReason::AlreadyOk),
            Some(ItemStatus::Failed) => Some(SkipReason::AlreadyFailed),
            Some(ItemStatus::Pending | ItemStatus::InProgress) | None => None,
        })
    }

    /// Records `stage` as running and returns its start time.
    fn enter(&self, item: &Item, stage: Stage, store: &StateStore) -> std::result::Result<Instant, Abort> {
        store.mark_stage(&item.id, stage)?;
        debug!(item_id = %item.id, phase = %ItemPhase::InProgress(stage), "stage started");
        Ok(Instant::now())
    }

    async fn run_stages(
        &self,
        item: &Item,
        work: &Path,
        store: &StateStore,
        progress: &ProgressReporter,
    ) -> std::result::Result<Completed, Abort> {
        let collaborators = self.collaborators.as_ref();
        let mut timings = BTreeMap::new();

        let t = self.enter(item, Stage::Metadata, store)?;
        let source = match collaborators.fetch_metadata(item).await {
            Ok(source) => source,
            Err(failure) if !self.config.metadata_required => {
                progress
                    .log_event(
                        EventKind::Warn,
                        Some(&item.id),
                        Some(&format!("metadata unavailable: {failure}")),
                        fields([("stage", json!(Stage::Metadata))]),
                    )
                    .await;
                serde_json::Map::new()
            }
            Err(failure) => return Err(Abort::Stage(Stage::Metadata, failure)),
        };
        timings.insert(Stage::Metadata.to_string(), t.elapsed().as_secs_f64());

        let t = self.enter(item, Stage::Acquire, store)?;
        let raw = with_retry(&self.config.acquire_retry, "acquire", || {
            collaborators.acquire(item, work)
        })
        .await
        .map_err(|f| Abort::Stage(Stage::Acquire, f))?;
        timings.insert(Stage::Acquire.to_string(), t.elapsed().as_secs_f64());

        let t = self.enter(item, Stage::Transform, store)?;
        let media = collaborators
            .transform(item, &raw, work)
            .await
            .map_err(|f| Abort::Stage(Stage::Transform, f))?;
        timings.insert(Stage::Transform.to_string(), t.elapsed().as_secs_f64());

        let t = self.enter(item, Stage::PrimaryCompute, store)?;
        let primary = collaborators
            .primary_compute(item, &media)
            .await
            .map_err(|f| Abort::Stage(Stage::PrimaryCompute, f))?;
        timings.insert(Stage::PrimaryCompute.to_string(), t.elapsed().as_secs_f64());

        let t = self.enter(item, Stage::SecondaryCompute, store)?;
        let sidecar_target = self.config.sidecar_path(&item.id);
        let media = media.as_path();
        let sidecar_target = sidecar_target.as_path();
        let secondary = with_retry(&self.config.secondary_retry, "secondary_compute", || {
            self.secondary_attempt(item, media, sidecar_target)
        })
        .await
        .map_err(|f| Abort::Stage(Stage::SecondaryCompute, f))?;
        timings.insert(Stage::SecondaryCompute.to_string(), t.elapsed().as_secs_f64());

        let words = word_count(&primary.text);
        let payload = json!({
            "text": primary.text,
            "primary": primary.detail,
            "secondary": secondary.detail,
        });
        let mut artifact = Artifact::success(item, source, payload);
        artifact.metadata.word_count = Some(words);
        artifact.metadata.stage_timings = timings;
        if secondary.sidecar.is_some() {
            artifact.metadata.sidecar_path = Some(
                self.config
                    .sidecar_relative_path(&item.id)
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        Ok(Completed { artifact, words })
    }

    /// One secondary compute attempt, including the sidecar write.
    async fn secondary_attempt(
        &self,
        item: &Item,
        media: &Path,
        sidecar_target: &Path,
    ) -> std::result::Result<SecondaryOutput, StageFailure> {
        let output = self.collaborators.secondary_compute(item, media).await?;
        if let Some(sidecar) = &output.sidecar {
            if sidecar.trim().is_empty() {
                return Err(StageFailure::permanent("secondary compute produced an empty sidecar"));
            }
            write_atomic(sidecar_target, sidecar)?;
        }
        Ok(output)
    }

    /// Writes the success artifact, then marks the item ok.
    async fn persist(
        &self,
        item: &Item,
        completed: Completed,
        started: Instant,
        store: &StateStore,
    ) -> std::result::Result<u64, Abort> {
        self.enter(item, Stage::Persist, store)?;
        let Completed { mut artifact, words } = completed;
        let seconds = started.elapsed().as_secs_f64();
        artifact.metadata.duration_seconds = Some(round3(seconds));

        let json = artifact
            .to_json()
            .map_err(|e| Abort::Stage(Stage::Persist, StageFailure::permanent(format!("serialize artifact: {e}"))))?;
        write_atomic(&self.config.artifact_path(&item.id), json)
            .map_err(|e| Abort::Stage(Stage::Persist, StageFailure::from(e)))?;

        store.mark_ok(&item.id, seconds, words)?;
        Ok(words)
    }

    /// Durably records a failed item. Only a store error is fatal.
    fn record_failure(
        &self,
        item: &Item,
        stage: Stage,
        failure: &StageFailure,
        store: &StateStore,
        error_log: &ErrorLog,
    ) -> Result<()> {
        store.mark_failed(&item.id, stage, &failure.message)?;

        let artifact = Artifact::failure(item, stage, &failure.message);
        let written = artifact
            .to_json()
            .map_err(std::io::Error::from)
            .and_then(|json| write_atomic(&self.config.artifact_path(&item.id), json));
        if let Err(e) = written {
            warn!(item_id = %item.id, error = %e, "failed to write failure artifact");
        }
        if let Err(e) = error_log.append(item, stage, &failure.message) {
            warn!(item_id = %item.id, error = %e, "failed to append to error log");
        }
        Ok(())
    }

    async fn pause(&self) {
        let delay = secs_to_duration(self.config.inter_item_delay_seconds)
            .saturating_add(secs_to_duration(random_jitter(self.config.inter_item_jitter_seconds)));
        if !delay.is_zero() {
            // A stop request cuts the pause short.
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.token.cancelled() => {}
            }
        }
    }
}

/// Runs the manifest at `manifest_path` with SIGINT/SIGTERM wired to a
/// graceful stop.
pub async fn run(
    manifest_path: impl AsRef<Path>,
    collaborators: Arc<dyn StageCollaborators>,
    config: RunConfig,
) -> Result<RunSummary> {
    let token = Arc::new(CancellationToken::new());
    let _shutdown = ShutdownCoordinator::install(Arc::clone(&token));
    let mut runner = Runner::new(config, collaborators).with_token(token);
    let summary = runner.run(manifest_path).await?;
    info!(
        ok = summary.ok,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "run complete"
    );
    Ok(summary)
}

fn fields<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn round3(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

//! On-disk fixtures for run tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RunConfig;
use crate::events::CollectingEventSink;
use crate::executor::{Runner, StageCollaborators};
use crate::progress::NoOpReporter;
use crate::retry::RetryPolicy;
use crate::store::StateStore;

/// A run layout rooted at a caller-provided directory.
///
/// The configuration has no inter-item pause and retries without sleeping,
/// so runs finish quickly.
#[derive(Debug)]
pub struct TestWorkspace {
    root: PathBuf,
    /// The configuration handed to runners.
    pub config: RunConfig,
    /// Events emitted by runners created through [`TestWorkspace::runner`].
    pub events: Arc<CollectingEventSink>,
}

impl TestWorkspace {
    /// Lays out `out/`, `state/` and `work/` under `root`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let config = RunConfig::new(root.join("out"))
            .with_state_dir(root.join("state"))
            .with_work_dir(root.join("work"))
            .with_retry(RetryPolicy::immediate(2), RetryPolicy::immediate(3))
            .with_inter_item_delay(0.0, 0.0);
        Self {
            root,
            config,
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `ids` as the manifest and returns its path.
    pub fn write_manifest(&self, ids: &[&str]) -> std::io::Result<PathBuf> {
        let path = self.config.manifest_path();
        let mut text = ids.join("\n");
        text.push('\n');
        crate::atomic::write_atomic(&path, text)?;
        Ok(path)
    }

    /// A runner with a collecting event sink and no progress output.
    #[must_use]
    pub fn runner(&self, collaborators: Arc<dyn StageCollaborators>) -> Runner {
        Runner::new(self.config.clone(), collaborators)
            .with_event_sink(self.events.clone())
            .with_reporter(Arc::new(NoOpReporter))
    }

    /// Opens the run's state store.
    pub fn store(&self) -> Result<StateStore, crate::errors::StoreError> {
        StateStore::open(self.config.store_path())
    }

    /// Reads and parses the artifact of `id`.
    pub fn artifact(&self, id: &str) -> Option<serde_json::Value> {
        let text = std::fs::read_to_string(self.config.artifact_path(id)).ok()?;
        serde_json::from_str(&text).ok()
    }
}

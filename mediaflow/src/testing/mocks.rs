//! Scriptable stage collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::{Item, Stage};
use crate::errors::StageFailure;
use crate::executor::{PrimaryOutput, SecondaryOutput, StageCollaborators};

/// Callback run when a stage is invoked for an item.
pub type StageHook = Arc<dyn Fn() + Send + Sync>;

type Key = (String, Stage);

/// Collaborators that succeed unless told otherwise.
///
/// Every invocation is recorded. By default each item produces the text
/// `"words of <id>"` and a one-line sidecar.
#[derive(Default)]
pub struct ScriptedCollaborators {
    queued: Mutex<HashMap<Key, VecDeque<StageFailure>>>,
    always: Mutex<HashMap<Key, StageFailure>>,
    hooks: Mutex<HashMap<Key, StageHook>>,
    texts: Mutex<HashMap<String, String>>,
    sidecars: Mutex<HashMap<String, Option<String>>>,
    calls: Mutex<Vec<Key>>,
}

impl std::fmt::Debug for ScriptedCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedCollaborators")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedCollaborators {
    /// Creates collaborators where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` invocations of `stage` for `id` fail.
    pub fn fail_times(&self, id: &str, stage: Stage, times: usize, failure: &StageFailure) {
        let mut queued = self.queued.lock();
        let queue = queued.entry((id.to_string(), stage)).or_default();
        queue.extend(std::iter::repeat(failure.clone()).take(times));
    }

    /// Makes every invocation of `stage` for `id` fail.
    pub fn fail_always(&self, id: &str, stage: Stage, failure: StageFailure) {
        self.always.lock().insert((id.to_string(), stage), failure);
    }

    /// Runs `hook` whenever `stage` is invoked for `id`.
    pub fn on_stage(&self, id: &str, stage: Stage, hook: StageHook) {
        self.hooks.lock().insert((id.to_string(), stage), hook);
    }

    /// Sets the primary text produced for `id`.
    pub fn set_text(&self, id: &str, text: impl Into<String>) {
        self.texts.lock().insert(id.to_string(), text.into());
    }

    /// Sets the sidecar produced for `id`; `None` produces no sidecar.
    pub fn set_sidecar(&self, id: &str, sidecar: Option<String>) {
        self.sidecars.lock().insert(id.to_string(), sidecar);
    }

    /// All invocations in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Stage)> {
        self.calls.lock().clone()
    }

    /// Number of invocations of `stage` for `id`.
    #[must_use]
    pub fn call_count(&self, id: &str, stage: Stage) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(i, s)| i == id && *s == stage)
            .count()
    }

    /// Ids whose processing began, in order (one entry per metadata call).
    #[must_use]
    pub fn started_items(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, s)| *s == Stage::Metadata)
            .map(|(i, _)| i.clone())
            .collect()
    }

    /// Total number of invocations.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn invoke(&self, id: &str, stage: Stage) -> Result<(), StageFailure> {
        let key = (id.to_string(), stage);
        self.calls.lock().push(key.clone());

        let hook = self.hooks.lock().get(&key).cloned();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(failure) = self.always.lock().get(&key) {
            return Err(failure.clone());
        }
        if let Some(failure) = self.queued.lock().get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(failure);
        }
        Ok(())
    }
}

#[async_trait]
impl StageCollaborators for ScriptedCollaborators {
    async fn fetch_metadata(
        &self,
        item: &Item,
    ) -> Result<serde_json::Map<String, serde_json::Value>, StageFailure> {
        self.invoke(&item.id, Stage::Metadata)?;
        let mut metadata = serde_json::Map::new();
        metadata.insert("original_title".to_string(), json!(format!("Title {}", item.id)));
        Ok(metadata)
    }

    async fn acquire(&self, item: &Item, work_dir: &Path) -> Result<PathBuf, StageFailure> {
        self.invoke(&item.id, Stage::Acquire)?;
        let path = work_dir.join(format!("{}.m4a", item.id));
        std::fs::write(&path, b"raw media")?;
        Ok(path)
    }

    async fn transform(
        &self,
        item: &Item,
        raw: &Path,
        work_dir: &Path,
    ) -> Result<PathBuf, StageFailure> {
        self.invoke(&item.id, Stage::Transform)?;
        let path = work_dir.join(format!("{}.16k.wav", item.id));
        std::fs::copy(raw, &path)?;
        Ok(path)
    }

    async fn primary_compute(&self, item: &Item, _media: &Path) -> Result<PrimaryOutput, StageFailure> {
        self.invoke(&item.id, Stage::PrimaryCompute)?;
        let text = self
            .texts
            .lock()
            .get(&item.id)
            .cloned()
            .unwrap_or_else(|| format!("words of {}", item.id));
        Ok(PrimaryOutput::new(text).with_detail(json!({ "segments": [] })))
    }

    async fn secondary_compute(
        &self,
        item: &Item,
        _media: &Path,
    ) -> Result<SecondaryOutput, StageFailure> {
        self.invoke(&item.id, Stage::SecondaryCompute)?;
        let sidecar = self
            .sidecars
            .lock()
            .get(&item.id)
            .cloned()
            .unwrap_or_else(|| Some(format!("SPEAKER {} 1 0.000 1.000 <NA> <NA> SPEAKER_00 <NA> <NA>\n", item.id)));
        let output = SecondaryOutput::new(json!({ "speakers": 1 }));
        Ok(match sidecar {
            Some(text) => output.with_sidecar(text),
            None => output,
        })
    }
}

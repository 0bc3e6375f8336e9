//! The seam between the orchestrator and the tools that do the real work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::{is_complete_artifact, Item};
use crate::errors::StageFailure;

/// Result of the primary compute stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimaryOutput {
    /// Main text output; its word count is the item's output metric.
    pub text: String,
    /// Structured detail stored under `payload.primary` (segments, model, ...).
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl PrimaryOutput {
    /// Creates an output with text and no detail.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detail: serde_json::Value::Null,
        }
    }

    /// Sets the structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Result of the secondary compute stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondaryOutput {
    /// Structured detail stored under `payload.secondary`.
    #[serde(default)]
    pub detail: serde_json::Value,
    /// Text written to the item's sidecar file (e.g. RTTM). Must not be empty
    /// when present.
    #[serde(default)]
    pub sidecar: Option<String>,
}

impl SecondaryOutput {
    /// Creates an output with structured detail only.
    #[must_use]
    pub fn new(detail: serde_json::Value) -> Self {
        Self {
            detail,
            sidecar: None,
        }
    }

    /// Sets the sidecar text.
    #[must_use]
    pub fn with_sidecar(mut self, sidecar: impl Into<String>) -> Self {
        self.sidecar = Some(sidecar.into());
        self
    }
}

/// External collaborators invoked by the executor, one method per stage.
///
/// Every stage returns a [`StageFailure`] on error; whether it is transient
/// decides if the retry policy tries again. Collaborators never touch the
/// state store or the artifact.
#[async_trait]
pub trait StageCollaborators: Send + Sync {
    /// Fetches descriptive metadata (title, author, duration...). The keys
    /// are merged into the artifact's metadata block.
    async fn fetch_metadata(
        &self,
        item: &Item,
    ) -> Result<serde_json::Map<String, serde_json::Value>, StageFailure>;

    /// Downloads the raw media into `work_dir` and returns its path.
    async fn acquire(&self, item: &Item, work_dir: &Path) -> Result<PathBuf, StageFailure>;

    /// Converts the raw media into the compute input format.
    async fn transform(
        &self,
        item: &Item,
        raw: &Path,
        work_dir: &Path,
    ) -> Result<PathBuf, StageFailure>;

    /// Runs the primary compute (speech-to-text).
    async fn primary_compute(&self, item: &Item, media: &Path) -> Result<PrimaryOutput, StageFailure>;

    /// Runs the secondary compute (speaker diarization).
    async fn secondary_compute(
        &self,
        item: &Item,
        media: &Path,
    ) -> Result<SecondaryOutput, StageFailure>;

    /// Returns true if the artifact at `artifact_path` proves the item is
    /// already done.
    ///
    /// The default accepts a well-formed artifact with `status: "ok"` whose
    /// recorded sidecar, if any, exists under `out_dir` and is non-empty.
    fn has_valid_artifact(&self, artifact_path: &Path, out_dir: &Path) -> bool {
        is_complete_artifact(artifact_path, out_dir)
    }
}

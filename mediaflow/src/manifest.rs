//! The durable, ordered list of item ids for a run.
//!
//! A manifest is built once from a streaming id source and reused by every
//! later run until an explicit rebuild. It is written through an
//! [`AtomicFile`], so an interrupted build never leaves a truncated manifest
//! at the real path.

use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::core::is_safe_id;
use crate::errors::{PipelineError, Result, StageFailure};
use crate::store::StateStore;

/// Builds a manifest from a stream of raw ids.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    path: PathBuf,
    limit: Option<u64>,
    force_rebuild: bool,
}

impl ManifestBuilder {
    /// Creates a builder targeting `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            limit: None,
            force_rebuild: false,
        }
    }

    /// Caps the manifest at `limit` unique ids; 0 means no cap.
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    /// Rebuilds even if a manifest already exists.
    #[must_use]
    pub fn with_force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    /// Returns true if [`ManifestBuilder::build`] would consume its source.
    #[must_use]
    pub fn needs_build(&self) -> bool {
        self.force_rebuild || !self.path.exists()
    }

    /// Produces the manifest and records its size in `store`.
    ///
    /// An existing manifest is reused without touching `source` unless a
    /// rebuild was forced. Blank lines are ignored, ids are trimmed, and only
    /// the first occurrence of each id is kept. Ids that cannot name a file
    /// (see [`is_safe_id`]) are dropped with a warning. Consumption stops as soon as
    /// the limit is reached. A source error aborts the build and leaves any
    /// previous manifest in place.
    pub async fn build<S>(&self, source: S, store: &StateStore) -> Result<Manifest>
    where
        S: Stream<Item = std::result::Result<String, StageFailure>>,
    {
        if !self.needs_build() {
            let manifest = Manifest::load(&self.path)?;
            manifest.ensure_total(store)?;
            info!(path = %self.path.display(), items = manifest.len(), "reusing existing manifest");
            return Ok(manifest);
        }

        info!(path = %self.path.display(), "building manifest");
        let mut file = AtomicFile::create(&self.path)?;
        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        futures::pin_mut!(source);
        while let Some(raw) = source.next().await {
            let raw = raw.map_err(PipelineError::ManifestSource)?;
            let id = raw.trim();
            if id.is_empty() || seen.contains(id) {
                continue;
            }
            if !is_safe_id(id) {
                warn!(id, "dropping unusable item id from manifest");
                continue;
            }
            writeln!(file, "{id}")?;
            seen.insert(id.to_string());
            ids.push(id.to_string());
            if self.limit.is_some_and(|limit| ids.len() as u64 >= limit) {
                break;
            }
        }
        file.commit()?;

        store.set_total(ids.len() as u64)?;
        info!(path = %self.path.display(), items = ids.len(), "manifest ready");
        Ok(Manifest {
            path: self.path.clone(),
            ids,
        })
    }
}

/// A loaded manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    path: PathBuf,
    ids: Vec<String>,
}

impl Manifest {
    /// Reads a manifest, skipping blank lines.
    ///
    /// Fails with [`PipelineError::InvalidItemId`] if a line holds an id that
    /// cannot name a file, before any item is touched.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut ids = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let id = line.trim();
            if id.is_empty() {
                continue;
            }
            if !is_safe_id(id) {
                return Err(PipelineError::InvalidItemId {
                    id: id.to_string(),
                    line: index + 1,
                });
            }
            ids.push(id.to_string());
        }
        Ok(Self {
            path: path.to_path_buf(),
            ids,
        })
    }

    /// Where the manifest lives.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ids in manifest order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the manifest lists nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns the stored total, recording this manifest's size first if the
    /// store has none.
    pub fn ensure_total(&self, store: &StateStore) -> Result<u64> {
        if let Some(total) = store.get_total()? {
            return Ok(total);
        }
        let total = self.ids.len() as u64;
        store.set_total(total)?;
        Ok(total)
    }
}

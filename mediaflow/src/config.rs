//! Run configuration and on-disk layout.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! out_dir = "/data/playlist"
//! fail_fast = true
//!
//! [acquire_retry]
//! max_attempts = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;

/// Which source of truth wins when deciding to skip an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// A valid success artifact skips the item even if the store recorded a
    /// failure; otherwise the store decides.
    #[default]
    ArtifactFirst,
    /// Only the store decides; artifacts are never inspected.
    StoreOnly,
}

/// Configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root of the artifacts.
    pub out_dir: PathBuf,
    /// Where the manifest, store and logs live; defaults to `<out_dir>/.state`.
    pub state_dir: Option<PathBuf>,
    /// Parent of the per-item scratch directories.
    pub work_dir: PathBuf,
    /// Reference derived from each id; `{id}` is replaced.
    pub reference_template: String,
    /// Directory under `out_dir` for sidecar files.
    pub sidecar_dir: String,
    /// Sidecar file extension, without the dot.
    pub sidecar_extension: String,
    /// Retry policy of the acquire stage.
    pub acquire_retry: RetryPolicy,
    /// Retry policy of the secondary compute stage.
    pub secondary_retry: RetryPolicy,
    /// Pause between items, in seconds.
    pub inter_item_delay_seconds: f64,
    /// Upper bound of the random extra pause between items, in seconds.
    pub inter_item_jitter_seconds: f64,
    /// Stop the run at the first failed item.
    pub fail_fast: bool,
    /// Reprocess items the store or artifacts mark as finished.
    pub retry_failed: bool,
    /// Process at most this many manifest entries; 0 means all.
    pub limit: u64,
    /// Leave per-item scratch directories in place.
    pub keep_work_dirs: bool,
    /// Rebuild the manifest even if one exists.
    pub rebuild_manifest: bool,
    /// Skip precedence.
    pub skip_policy: SkipPolicy,
    /// Treat a metadata failure as an item failure instead of a warning.
    pub metadata_required: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            state_dir: None,
            work_dir: std::env::temp_dir().join("mediaflow"),
            reference_template: "https://www.youtube.com/watch?v={id}".to_string(),
            sidecar_dir: "rttm".to_string(),
            sidecar_extension: "rttm".to_string(),
            acquire_retry: RetryPolicy::new(2, 1.0, 0.5),
            secondary_retry: RetryPolicy::new(3, 2.0, 1.0),
            inter_item_delay_seconds: 0.3,
            inter_item_jitter_seconds: 0.3,
            fail_fast: false,
            retry_failed: false,
            limit: 0,
            keep_work_dirs: false,
            rebuild_manifest: false,
            skip_policy: SkipPolicy::ArtifactFirst,
            metadata_required: false,
        }
    }
}

impl RunConfig {
    /// Creates a default configuration writing to `out_dir`.
    #[must_use]
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a TOML file and validates it.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides.
    ///
    /// - `MEDIAFLOW_OUT_DIR` → `out_dir`
    /// - `MEDIAFLOW_STATE_DIR` → `state_dir`
    /// - `MEDIAFLOW_WORK_DIR` → `work_dir`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = non_empty_env("MEDIAFLOW_OUT_DIR") {
            self.out_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("MEDIAFLOW_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = non_empty_env("MEDIAFLOW_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        self
    }

    /// Sets the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Sets the scratch directory parent.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets both retry policies.
    #[must_use]
    pub fn with_retry(mut self, acquire: RetryPolicy, secondary: RetryPolicy) -> Self {
        self.acquire_retry = acquire;
        self.secondary_retry = secondary;
        self
    }

    /// Sets the pause between items.
    #[must_use]
    pub fn with_inter_item_delay(mut self, delay_seconds: f64, jitter_seconds: f64) -> Self {
        self.inter_item_delay_seconds = delay_seconds;
        self.inter_item_jitter_seconds = jitter_seconds;
        self
    }

    /// Enables or disables fail-fast.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Enables or disables reprocessing of finished items.
    #[must_use]
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    /// Caps the number of manifest entries processed.
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the skip precedence.
    #[must_use]
    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }

    /// Makes metadata failures fatal for the item.
    #[must_use]
    pub fn with_metadata_required(mut self, required: bool) -> Self {
        self.metadata_required = required;
        self
    }

    /// Keeps scratch directories after each item.
    #[must_use]
    pub fn with_keep_work_dirs(mut self, keep: bool) -> Self {
        self.keep_work_dirs = keep;
        self
    }

    /// Checks ranges and required values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.out_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("out_dir", "must not be empty"));
        }
        if self.reference_template.trim().is_empty() {
            return Err(ConfigError::invalid("reference_template", "must not be empty"));
        }
        if self.sidecar_dir.is_empty() || self.sidecar_dir.contains(['/', '\\']) {
            return Err(ConfigError::invalid("sidecar_dir", "must be a single directory name"));
        }
        if self.sidecar_extension.is_empty() || self.sidecar_extension.starts_with('.') {
            return Err(ConfigError::invalid(
                "sidecar_extension",
                "must be non-empty and given without the leading dot",
            ));
        }
        validate_policy("acquire_retry", &self.acquire_retry)?;
        validate_policy("secondary_retry", &self.secondary_retry)?;
        non_negative("inter_item_delay_seconds", self.inter_item_delay_seconds)?;
        non_negative("inter_item_jitter_seconds", self.inter_item_jitter_seconds)?;
        Ok(())
    }

    /// The resolved state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.out_dir.join(".state"))
    }

    /// `<state>/manifest.txt`
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir().join("manifest.txt")
    }

    /// `<state>/state.db`
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.state_dir().join("state.db")
    }

    /// `<state>/events.jsonl`
    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.state_dir().join("events.jsonl")
    }

    /// `<state>/errors.log`
    #[must_use]
    pub fn error_log_path(&self) -> PathBuf {
        self.state_dir().join("errors.log")
    }

    /// `<out>/json/<id>.json`
    #[must_use]
    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.out_dir.join("json").join(format!("{id}.json"))
    }

    /// Sidecar path relative to `out_dir`.
    #[must_use]
    pub fn sidecar_relative_path(&self, id: &str) -> PathBuf {
        Path::new(&self.sidecar_dir).join(format!("{id}.{}", self.sidecar_extension))
    }

    /// `<out>/<sidecar_dir>/<id>.<ext>`
    #[must_use]
    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        self.out_dir.join(self.sidecar_relative_path(id))
    }

    /// `<work>/<id>`
    #[must_use]
    pub fn work_path(&self, id: &str) -> PathBuf {
        self.work_dir.join(id)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Upper bound for any configured delay, in seconds (one day).
pub const MAX_DELAY_SECONDS: f64 = 86_400.0;

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=MAX_DELAY_SECONDS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be between 0 and {MAX_DELAY_SECONDS} seconds, got {value}"),
        ))
    }
}

fn validate_policy(field: &'static str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(ConfigError::invalid(field, "max_attempts must be at least 1"));
    }
    non_negative(field, policy.base_delay_seconds)?;
    non_negative(field, policy.jitter_seconds)?;
    non_negative(field, policy.max_delay_seconds)
}

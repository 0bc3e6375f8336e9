//! # Mediaflow
//!
//! Resumable batch orchestration for media processing pipelines.
//!
//! Mediaflow walks a manifest of item ids and drives each one through a fixed
//! sequence of stages (metadata, acquire, transform, primary compute,
//! secondary compute, persist), with support for:
//!
//! - **Crash-safe resume**: a durable SQLite ledger records every item's
//!   status, attempts and last error
//! - **Atomic artifacts**: one JSON document per item, never half-written
//! - **Failure isolation**: a failed item is recorded and the run moves on
//! - **Bounded retries**: per-stage attempt budgets with exponential backoff
//! - **Graceful shutdown**: SIGINT/SIGTERM stop the run between items
//!
//! The stage work itself is supplied by the caller through
//! [`StageCollaborators`](executor::StageCollaborators).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaflow::prelude::*;
//!
//! let config = RunConfig::from_toml_file("mediaflow.toml")?.with_env_overrides();
//! let mut runner = Runner::new(config, Arc::new(MyCollaborators::new()));
//!
//! // Enumerate the playlist once; later runs reuse the manifest.
//! let manifest = runner.build_manifest(stream_lines(list_command, timeout)).await?;
//! let summary = runner.run(manifest.path()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod atomic;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod manifest;
pub mod process;
pub mod progress;
pub mod retry;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, ShutdownCoordinator};
    pub use crate::config::{RunConfig, SkipPolicy};
    pub use crate::core::{Artifact, Event, EventKind, Item, ItemStatus, Stage};
    pub use crate::errors::{FailureKind, PipelineError, StageFailure};
    pub use crate::events::{EventSink, JsonlEventSink, NoOpEventSink};
    pub use crate::executor::{run, PrimaryOutput, RunSummary, Runner, SecondaryOutput, StageCollaborators};
    pub use crate::manifest::{Manifest, ManifestBuilder};
    pub use crate::process::{run_command, stream_lines};
    pub use crate::progress::{LoggingReporter, NoOpReporter, Reporter};
    pub use crate::retry::{with_retry, RetryPolicy};
    pub use crate::store::StateStore;
    pub use crate::utils::{iso_timestamp, Timestamp};
}

pub use errors::{PipelineError, Result};

//! The per-item state machine that drives a run.
//!
//! For every manifest entry the [`Runner`] decides whether to skip it, then
//! runs the fixed stage sequence through the [`StageCollaborators`], records
//! the outcome in the state store, persists the artifact atomically and
//! reports progress. Items are processed one at a time; cancellation is
//! honoured only between items.

mod collaborators;
mod runner;
mod work_area;


pub use collaborators::{PrimaryOutput, SecondaryOutput, StageCollaborators};
pub use runner::{run, ItemPhase, RunSummary, Runner, SkipReason};
pub use work_area::WorkArea;

//! Testing utilities for mediaflow runs.
//!
//! This module provides:
//! - [`ScriptedCollaborators`], stage collaborators whose failures are
//!   scripted per item and stage
//! - [`TestWorkspace`], an on-disk layout with a manifest and a quiet runner

mod fixtures;
mod mocks;

pub use fixtures::TestWorkspace;
pub use mocks::{ScriptedCollaborators, StageHook};

//! Core domain model types for mediaflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Items and their canonical references
//! - Item status and stage enums
//! - Progress events and per-item artifacts

mod artifact;
mod event;
mod item;
mod status;

pub use artifact::{
    is_complete_artifact, is_valid_ok_artifact, Artifact, ArtifactMetadata, ArtifactStatus, FailureBlock,
    ARTIFACT_ERROR_LIMIT,
};
pub use event::{Event, EventKind};
pub use item::{is_safe_id, Item, ID_PLACEHOLDER};
pub use status::{ItemStatus, Stage};

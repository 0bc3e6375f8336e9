//! Work items.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Placeholder replaced by the item id in a reference template.
pub const ID_PLACEHOLDER: &str = "{id}";

/// One unit of work: a stable identifier plus the canonical reference
/// (usually a URL) the collaborators act on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    /// Opaque identifier, unique within a run.
    pub id: String,
    /// Canonical reference derived from the id.
    pub reference: String,
}

impl Item {
    /// Creates an item from an id and an explicit reference.
    #[must_use]
    pub fn new(id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reference: reference.into(),
        }
    }

    /// Creates an item whose reference is `template` with every `{id}`
    /// replaced by the id.
    #[must_use]
    pub fn from_template(id: impl Into<String>, template: &str) -> Self {
        let id = id.into();
        let reference = template.replace(ID_PLACEHOLDER, &id);
        Self { id, reference }
    }
}

/// Returns true if `id` can name a file or directory of its own.
///
/// Ids end up as path components (`<work>/<id>`, `<out>/json/<id>.json`), so
/// an id must be a single normal component: not empty, not `.` or `..`, no
/// separators, not absolute.
#[must_use]
pub fn is_safe_id(id: &str) -> bool {
    if id.is_empty() || id.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

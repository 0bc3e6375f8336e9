//! The per-item output document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{Item, Stage};

/// Maximum characters of failure text stored in a failure artifact.
pub const ARTIFACT_ERROR_LIMIT: usize = 2000;

/// Metadata keys owned by the orchestrator; source metadata may not shadow them.
const RESERVED_KEYS: [&str; 9] = [
    "item_id",
    "source_url",
    "retrieval_timestamp_utc",
    "status",
    "failure_stage",
    "word_count",
    "duration_seconds",
    "stage_timings",
    "sidecar_path",
];

/// Status recorded inside an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// The item completed every stage.
    Ok,
    /// The item failed at `failure_stage`.
    Failed,
}

/// The metadata block shared by success and failure artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Item identifier.
    pub item_id: String,
    /// Canonical reference of the source.
    pub source_url: String,
    /// When the artifact was produced (ISO 8601).
    pub retrieval_timestamp_utc: String,
    /// Success or failure.
    pub status: ArtifactStatus,
    /// Stage that failed, for failure artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<Stage>,
    /// Output metric (word count of the primary text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u64>,
    /// Wall time spent on the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Seconds spent in each completed stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_timings: BTreeMap<String, f64>,
    /// Sidecar path relative to the output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_path: Option<String>,
    /// Source metadata reported by the metadata stage (title, author, ...).
    #[serde(default, flatten)]
    pub source: serde_json::Map<String, serde_json::Value>,
}

/// The failure block of a failure artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBlock {
    /// Bounded failure message.
    pub message: String,
}

/// A persisted per-item output document, in success or failure form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Metadata block.
    pub metadata: ArtifactMetadata,
    /// Stage-specific result, success form only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Failure reason, failure form only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureBlock>,
}

impl Artifact {
    /// Creates a success artifact.
    #[must_use]
    pub fn success(
        item: &Item,
        mut source: serde_json::Map<String, serde_json::Value>,
        payload: serde_json::Value,
    ) -> Self {
        source.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
        Self {
            metadata: ArtifactMetadata {
                item_id: item.id.clone(),
                source_url: item.reference.clone(),
                retrieval_timestamp_utc: crate::utils::iso_timestamp(),
                status: ArtifactStatus::Ok,
                failure_stage: None,
                word_count: None,
                duration_seconds: None,
                stage_timings: BTreeMap::new(),
                sidecar_path: None,
                source,
            },
            payload: Some(payload),
            failure: None,
        }
    }

    /// Creates a failure artifact with a bounded message.
    #[must_use]
    pub fn failure(item: &Item, stage: Stage, message: &str) -> Self {
        Self {
            metadata: ArtifactMetadata {
                item_id: item.id.clone(),
                source_url: item.reference.clone(),
                retrieval_timestamp_utc: crate::utils::iso_timestamp(),
                status: ArtifactStatus::Failed,
                failure_stage: Some(stage),
                word_count: None,
                duration_seconds: None,
                stage_timings: BTreeMap::new(),
                sidecar_path: None,
                source: serde_json::Map::new(),
            },
            payload: None,
            failure: Some(FailureBlock {
                message: crate::utils::tail(message, ARTIFACT_ERROR_LIMIT).to_string(),
            }),
        }
    }

    /// Renders the artifact as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Returns true if the artifact records a successful item.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.metadata.status == ArtifactStatus::Ok
    }
}

/// Returns true if `path` holds a well-formed artifact whose metadata reports
/// `status: "ok"`.
///
/// Only the status field is inspected so artifacts written by older versions,
/// or carrying extra fields, are still recognised.
#[must_use]
pub fn is_valid_ok_artifact(path: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    serde_json::from_str::<serde_json::Value>(&text)
        .map(|doc| doc["metadata"]["status"] == "ok")
        .unwrap_or(false)
}

/// Returns true if `path` is a valid ok artifact and the sidecar it records,
/// if any, exists under `out_dir` and is non-empty.
#[must_use]
pub fn is_complete_artifact(path: &Path, out_dir: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(&text) else {
        return false;
    };
    if doc["metadata"]["status"] != "ok" {
        return false;
    }
    match doc["metadata"]["sidecar_path"].as_str() {
        Some(relative) => std::fs::metadata(out_dir.join(relative)).is_ok_and(|m| m.len() > 0),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> Item {
        Item::new("vid1", "https://example.com/watch?v=vid1")
    }

    #[test]
    fn test_success_artifact_shape() {
        let mut source = serde_json::Map::new();
        source.insert("original_title".to_string(), json!("Episode 1"));
        source.insert("status".to_string(), json!("private"));

        let mut artifact = Artifact::success(&item(), source, json!({"text": "hello world"}));
        artifact.metadata.word_count = Some(2);

        let value: serde_json::Value = serde_json::from_str(&artifact.to_json().unwrap()).unwrap();
        assert_eq!(value["metadata"]["status"], "ok");
        assert_eq!(value["metadata"]["original_title"], "Episode 1");
        assert_eq!(value["metadata"]["word_count"], 2);
        assert_eq!(value["payload"]["text"], "hello world");
        assert!(value.get("failure").is_none());
        assert!(value["metadata"].get("failure_stage").is_none());
    }

    #[test]
    fn test_failure_artifact_bounds_message() {
        let long = "x".repeat(ARTIFACT_ERROR_LIMIT + 500);
        let artifact = Artifact::failure(&item(), Stage::Acquire, &long);

        assert!(!artifact.is_ok());
        assert_eq!(artifact.metadata.failure_stage, Some(Stage::Acquire));
        assert_eq!(
            artifact.failure.as_ref().unwrap().message.chars().count(),
            ARTIFACT_ERROR_LIMIT
        );
        assert!(artifact.payload.is_none());
    }

    #[test]
    fn test_is_valid_ok_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let ok_path = dir.path().join("ok.json");
        let failed_path = dir.path().join("failed.json");
        let garbage_path = dir.path().join("garbage.json");

        let ok = Artifact::success(&item(), serde_json::Map::new(), json!({}));
        std::fs::write(&ok_path, ok.to_json().unwrap()).unwrap();
        let failed = Artifact::failure(&item(), Stage::Transform, "bad input");
        std::fs::write(&failed_path, failed.to_json().unwrap()).unwrap();
        std::fs::write(&garbage_path, "{\"metadata\": {\"status\": \"o").unwrap();

        assert!(is_valid_ok_artifact(&ok_path));
        assert!(!is_valid_ok_artifact(&failed_path));
        assert!(!is_valid_ok_artifact(&garbage_path));
        assert!(!is_valid_ok_artifact(&dir.path().join("missing.json")));
    }

    #[test]
    fn test_complete_artifact_requires_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("json/vid1.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        let mut artifact = Artifact::success(&item(), serde_json::Map::new(), json!({}));
        artifact.metadata.sidecar_path = Some("rttm/vid1.rttm".to_string());
        std::fs::write(&path, artifact.to_json().unwrap()).unwrap();
        assert!(is_valid_ok_artifact(&path));
        assert!(!is_complete_artifact(&path, dir.path()));

        std::fs::create_dir_all(dir.path().join("rttm")).unwrap();
        std::fs::write(dir.path().join("rttm/vid1.rttm"), "").unwrap();
        assert!(!is_complete_artifact(&path, dir.path()));

        std::fs::write(dir.path().join("rttm/vid1.rttm"), "SPEAKER vid1 1 0.0 1.0").unwrap();
        assert!(is_complete_artifact(&path, dir.path()));
    }
}

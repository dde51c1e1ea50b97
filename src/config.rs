use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Labels whose names mark a frame as worth alerting on when the stored
/// object is assessed by the remote label service.
pub const DEFAULT_TRIGGER_WORDS: [&str; 10] = [
    "Human", "People", "Person", "Male", "Female", "Apparel", "Clothing",
    "Selfie", "Costume", "Portrait",
];

pub const DEFAULT_FRAME_OFFSET: i64 = 600;

/// A recorder monitor and the names people use for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A face known to the face database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceConfig {
    pub database_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Matches against detected object labels instead of faces (pets).
    #[serde(default)]
    pub as_object: bool,
}

/// Pipeline configuration loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub cameras: Vec<CameraConfig>,
    pub faces: Vec<FaceConfig>,
    pub trigger_words: Vec<String>,
    /// Object labels that qualify a locally detected frame as an alert.
    /// Empty means any label qualifies.
    pub alert_labels: Vec<String>,
    pub min_label_score: f64,
    /// Faces that should produce a notification.
    pub find_faces: Vec<String>,
    /// Frames an event must advance before the same event notifies again.
    pub frame_offset: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            faces: Vec::new(),
            trigger_words: DEFAULT_TRIGGER_WORDS
                .iter()
                .map(|w| w.to_string())
                .collect(),
            alert_labels: Vec::new(),
            min_label_score: 0.0,
            find_faces: Vec::new(),
            frame_offset: DEFAULT_FRAME_OFFSET,
        }
    }
}

impl PipelineConfig {
    /// Load the configuration, falling back to defaults when no file is
    /// configured or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No pipeline config given, using defaults");
            return Ok(Self::default());
        };
        if !path.exists() {
            warn!(
                "Pipeline config {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).with_context(|| {
            format!("Failed to read pipeline config {}", path.display())
        })?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| {
                format!("Failed to parse pipeline config {}", path.display())
            })?;
        info!(
            "Loaded pipeline config with {} cameras and {} faces",
            config.cameras.len(),
            config.faces.len()
        );
        Ok(config)
    }

    pub fn camera_names(&self) -> Vec<String> {
        self.cameras.iter().map(|c| c.name.clone()).collect()
    }
}

//! Object and face detection for alarm frames.
//!
//! A [`Dispatcher`] sends a batch of image paths to the configured
//! [`DetectionBackend`] and, when face recognition is enabled, passes the
//! results through a [`FaceRecognizer`]. Results always come back in input
//! order, one per image.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with_macros::skip_serializing_none;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

pub mod faces;
pub mod fake;
pub mod local;
pub mod remote;

/// Normalized box corners, each in 0..1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub ymin: f64,
    pub xmin: f64,
    pub ymax: f64,
    pub xmax: f64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    /// Confidence, 0 to 100.
    pub score: f64,
    #[serde(rename = "box", default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub face: Option<String>,
    #[serde(rename = "faceConfidence", default)]
    pub face_confidence: Option<f64>,
}

impl Label {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
            bbox: None,
            face: None,
            face_confidence: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub image: String,
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Local,
    Remote,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Local => "local",
            DetectionMode::Remote => "remote",
        }
    }
}

#[async_trait]
pub trait DetectionBackend: Send + Sync {
    fn mode(&self) -> DetectionMode;

    /// Detect objects in each image. May return results in any order.
    async fn detect_batch(
        &self,
        image_paths: &[String],
    ) -> Result<Vec<DetectionResult>>;
}

#[async_trait]
pub trait FaceRecognizer: Send + Sync {
    /// Enrich person labels with face names.
    async fn recognize(
        &self,
        results: Vec<DetectionResult>,
    ) -> Result<Vec<DetectionResult>>;
}

/// Label detection on an image that is already in blob storage.
#[async_trait]
pub trait StoredImageDetector: Send + Sync {
    async fn detect_stored(&self, bucket: &str, key: &str) -> Result<Vec<Label>>;
}

/// Put `results` back into the order of `images`, failing if any image is
/// missing or unexpected.
pub fn align_results(
    images: &[String],
    results: Vec<DetectionResult>,
) -> Result<Vec<DetectionResult>> {
    if images.len() != results.len() {
        return Err(anyhow!(
            "detection returned {} results for {} images",
            results.len(),
            images.len()
        ));
    }
    let mut by_image: HashMap<String, DetectionResult> = results
        .into_iter()
        .map(|r| (r.image.clone(), r))
        .collect();
    images
        .iter()
        .map(|image| {
            by_image
                .remove(image)
                .ok_or_else(|| anyhow!("detection returned no result for {}", image))
        })
        .collect()
}

pub struct Dispatcher {
    backend: Arc<dyn DetectionBackend>,
    faces: Option<Arc<dyn FaceRecognizer>>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn DetectionBackend>,
        faces: Option<Arc<dyn FaceRecognizer>>,
    ) -> Self {
        Self { backend, faces }
    }

    pub fn mode(&self) -> DetectionMode {
        self.backend.mode()
    }

    pub fn face_recognition_enabled(&self) -> bool {
        self.faces.is_some()
    }

    #[instrument(skip(self, image_paths), fields(count = image_paths.len()), err)]
    pub async fn detect_objects(
        &self,
        image_paths: &[String],
    ) -> Result<Vec<DetectionResult>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }
        let results = self.backend.detect_batch(image_paths).await?;
        align_results(image_paths, results)
    }

    /// Pass results through the face stage. Without one, results are
    /// returned unchanged.
    #[instrument(skip(self, results), fields(count = results.len()), err)]
    pub async fn detect_faces(
        &self,
        results: Vec<DetectionResult>,
    ) -> Result<Vec<DetectionResult>> {
        let Some(faces) = &self.faces else {
            return Ok(results);
        };
        if results.is_empty() {
            return Ok(results);
        }
        let images: Vec<String> =
            results.iter().map(|r| r.image.clone()).collect();
        let enriched = faces.recognize(results).await?;
        align_results(&images, enriched)
    }

    pub async fn detect(
        &self,
        image_paths: &[String],
    ) -> Result<Vec<DetectionResult>> {
        let objects = self.detect_objects(image_paths).await?;
        let results = self.detect_faces(objects).await?;
        debug!(
            "Detected {} labels across {} images",
            results.iter().map(|r| r.labels.len()).sum::<usize>(),
            results.len()
        );
        Ok(results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    Detect,
    Skip,
}

/// Decide which frames of a batch go to detection. Frames are counted per
/// monitor; the n-th frame of a monitor is detected when
/// `(n - 1) % (frame_skip + 1) == 0`.
pub fn plan_sampling<'a>(
    monitors: impl IntoIterator<Item = &'a str>,
    frame_skip: u32,
) -> Vec<SampleDecision> {
    let stride = u64::from(frame_skip) + 1;
    let mut seen: HashMap<&str, u64> = HashMap::new();
    monitors
        .into_iter()
        .map(|monitor| {
            let n = seen.entry(monitor).or_insert(0);
            *n += 1;
            if (*n - 1) % stride == 0 {
                SampleDecision::Detect
            } else {
                SampleDecision::Skip
            }
        })
        .collect()
}

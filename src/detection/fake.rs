use super::{
    DetectionBackend, DetectionMode, DetectionResult, FaceRecognizer, Label,
    StoredImageDetector,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Detection backend with canned labels per image. Images without canned
/// labels come back empty.
pub struct FakeDetectionBackend {
    mode: DetectionMode,
    labels: HashMap<String, Vec<Label>>,
    calls: Mutex<Vec<Vec<String>>>,
    failure: Option<String>,
}

impl FakeDetectionBackend {
    pub fn new() -> Self {
        Self {
            mode: DetectionMode::Local,
            labels: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            failure: None,
        }
    }

    pub fn with_mode(mut self, mode: DetectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_labels(mut self, image: &str, labels: Vec<Label>) -> Self {
        self.labels.insert(image.to_string(), labels);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Image batches received so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Default for FakeDetectionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectionBackend for FakeDetectionBackend {
    fn mode(&self) -> DetectionMode {
        self.mode
    }

    async fn detect_batch(
        &self,
        image_paths: &[String],
    ) -> Result<Vec<DetectionResult>> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(image_paths.to_vec());
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(image_paths
            .iter()
            .map(|image| DetectionResult {
                image: image.clone(),
                labels: self.labels.get(image).cloned().unwrap_or_default(),
            })
            .collect())
    }
}

/// Names every person label with one face.
pub struct FakeFaceRecognizer {
    face: String,
}

impl FakeFaceRecognizer {
    pub fn new(face: &str) -> Self {
        Self {
            face: face.to_string(),
        }
    }
}

#[async_trait]
impl FaceRecognizer for FakeFaceRecognizer {
    async fn recognize(
        &self,
        mut results: Vec<DetectionResult>,
    ) -> Result<Vec<DetectionResult>> {
        for label in results.iter_mut().flat_map(|r| r.labels.iter_mut()) {
            if label.name.eq_ignore_ascii_case("person") {
                label.face = Some(self.face.clone());
                label.face_confidence = Some(99.0);
            }
        }
        Ok(results)
    }
}

/// Stored-image detector returning the same labels for every object.
pub struct FakeStoredImageDetector {
    labels: Vec<Label>,
    calls: Mutex<Vec<String>>,
}

impl FakeStoredImageDetector {
    pub fn new(labels: Vec<Label>) -> Self {
        Self {
            labels,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl StoredImageDetector for FakeStoredImageDetector {
    async fn detect_stored(&self, _bucket: &str, key: &str) -> Result<Vec<Label>> {
        self.calls.lock().expect("calls lock").push(key.to_string());
        Ok(self.labels.clone())
    }
}

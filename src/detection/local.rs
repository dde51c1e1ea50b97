use super::{BoundingBox, DetectionBackend, DetectionMode, DetectionResult, Label};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Client for the detection service running next to the recorder. The
/// service scores labels 0 to 1.
pub struct LocalDetectionClient {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    images: &'a [String],
}

#[derive(Debug, Deserialize)]
struct LocalLabel {
    name: String,
    score: f64,
    #[serde(rename = "box")]
    bbox: Option<BoundingBox>,
}

#[derive(Debug, Deserialize)]
struct LocalResult {
    image: String,
    #[serde(default)]
    labels: Vec<LocalLabel>,
}

impl LocalDetectionClient {
    /// `heartbeat` bounds a whole batch request; a service that stops
    /// answering within it is treated as failed.
    pub fn new(url: impl Into<String>, heartbeat: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(heartbeat)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(1)
            .build()
            .context("Failed to build detection service client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn into_result(raw: LocalResult) -> DetectionResult {
    DetectionResult {
        image: raw.image,
        labels: raw
            .labels
            .into_iter()
            .map(|l| Label {
                name: l.name,
                score: l.score * 100.0,
                bbox: l.bbox,
                face: None,
                face_confidence: None,
            })
            .collect(),
    }
}

#[async_trait]
impl DetectionBackend for LocalDetectionClient {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Local
    }

    #[instrument(skip(self, image_paths), fields(count = image_paths.len()), err)]
    async fn detect_batch(
        &self,
        image_paths: &[String],
    ) -> Result<Vec<DetectionResult>> {
        let response = self
            .client
            .post(&self.url)
            .json(&DetectRequest {
                images: image_paths,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("detection service missed its heartbeat: {}", e)
                } else {
                    anyhow!("detection service request failed: {}", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "detection service returned {}: {}",
                status,
                body
            ));
        }

        let raw: Vec<LocalResult> = response
            .json()
            .await
            .context("Failed to parse detection service response")?;
        debug!("Detection service answered for {} images", raw.len());
        Ok(raw.into_iter().map(into_result).collect())
    }
}

use super::{
    BoundingBox, DetectionBackend, DetectionMode, DetectionResult, Label,
    StoredImageDetector,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

pub const DEFAULT_MAX_LABELS: i32 = 100;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 50.0;

/// Label detection through AWS Rekognition, one call per image.
pub struct RekognitionDetector {
    region: Option<String>,
    max_labels: i32,
    min_confidence: f32,
    client: OnceCell<Client>,
}

impl RekognitionDetector {
    pub fn new(region: Option<String>, min_confidence: f32) -> Self {
        Self {
            region,
            max_labels: DEFAULT_MAX_LABELS,
            min_confidence,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let mut loader =
                    aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = self.region.clone() {
                    loader = loader.region(aws_config::Region::new(region));
                }
                let config = loader.load().await;
                Ok(Client::new(&config))
            })
            .await
    }

    async fn detect_labels(&self, image: Image, what: &str) -> Result<Vec<Label>> {
        let response = self
            .client()
            .await?
            .detect_labels()
            .image(image)
            .max_labels(self.max_labels)
            .min_confidence(self.min_confidence)
            .send()
            .await
            .map_err(|error| {
                anyhow!("Rekognition detect_labels failed for {what}: {error:?}")
            })?;

        let labels: Vec<Label> = response
            .labels()
            .iter()
            .filter_map(|label| {
                let name = label.name()?.to_string();
                let bbox = label
                    .instances()
                    .first()
                    .and_then(|instance| instance.bounding_box())
                    .map(|b| {
                        let left = f64::from(b.left().unwrap_or(0.0));
                        let top = f64::from(b.top().unwrap_or(0.0));
                        BoundingBox {
                            ymin: top,
                            xmin: left,
                            ymax: top + f64::from(b.height().unwrap_or(0.0)),
                            xmax: left + f64::from(b.width().unwrap_or(0.0)),
                        }
                    });
                Some(Label {
                    name,
                    score: f64::from(label.confidence().unwrap_or(0.0)),
                    bbox,
                    face: None,
                    face_confidence: None,
                })
            })
            .collect();
        debug!("Rekognition found {} labels for {}", labels.len(), what);
        Ok(labels)
    }
}

#[async_trait]
impl DetectionBackend for RekognitionDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Remote
    }

    #[instrument(skip(self, image_paths), fields(count = image_paths.len()), err)]
    async fn detect_batch(
        &self,
        image_paths: &[String],
    ) -> Result<Vec<DetectionResult>> {
        let mut results = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read image {}", path))?;
            let image = Image::builder().bytes(Blob::new(bytes)).build();
            let labels = self.detect_labels(image, path).await?;
            results.push(DetectionResult {
                image: path.clone(),
                labels,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl StoredImageDetector for RekognitionDetector {
    #[instrument(skip(self), err)]
    async fn detect_stored(&self, bucket: &str, key: &str) -> Result<Vec<Label>> {
        let object = S3Object::builder().bucket(bucket).name(key).build();
        let image = Image::builder().s3_object(object).build();
        self.detect_labels(image, key).await
    }
}

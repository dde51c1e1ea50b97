use super::{BlobStore, ObjectHead};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

pub struct S3BlobStore {
    region: Option<String>,
    endpoint_url: Option<String>,
    client: OnceCell<Client>,
}

impl S3BlobStore {
    pub fn new(region: Option<String>, endpoint_url: Option<String>) -> Self {
        Self {
            region,
            endpoint_url,
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
                let mut builder = aws_sdk_s3::config::Builder::from(&config);
                if let Some(endpoint) = self.endpoint_url.clone() {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                Ok(Client::from_conf(builder.build()))
            })
            .await
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, body, metadata), fields(size = body.len()), err)]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.client()
            .await?
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("image/jpeg")
            .set_metadata(Some(metadata))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|error| anyhow!("S3 put_object failed for '{key}': {error:?}"))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client()
            .await?
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| anyhow!("S3 get_object failed for '{key}': {error:?}"))?;
        let bytes = response
            .body
            .collect()
            .await
            .context("read S3 object body")?;
        Ok(bytes.into_bytes().to_vec())
    }

    #[instrument(skip(self), err)]
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let response = self
            .client()
            .await?
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| anyhow!("S3 head_object failed for '{key}': {error:?}"))?;
        Ok(ObjectHead {
            storage_class: response
                .storage_class()
                .map(|class| class.as_str().to_string()),
            metadata: response.metadata().cloned().unwrap_or_default(),
            last_modified: response.last_modified().and_then(to_chrono),
        })
    }

    #[instrument(skip(self), err)]
    async fn copy(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
        storage_class: Option<&str>,
    ) -> Result<DateTime<Utc>> {
        let response = self
            .client()
            .await?
            .copy_object()
            .bucket(bucket)
            .copy_source(format!("{}/{}", bucket, from_key))
            .key(to_key)
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(|error| {
                anyhow!("S3 copy_object failed for '{from_key}' -> '{to_key}': {error:?}")
            })?;
        Ok(response
            .copy_object_result()
            .and_then(|result| result.last_modified())
            .and_then(to_chrono)
            .unwrap_or_else(Utc::now))
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client()
            .await?
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| anyhow!("S3 delete_object failed for '{key}': {error:?}"))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .context("build S3 presigning config")?;
        let request = self
            .client()
            .await?
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|error| anyhow!("S3 presign failed for '{key}': {error:?}"))?;
        Ok(request.uri().to_string())
    }
}

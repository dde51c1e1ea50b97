use super::{BlobStore, ObjectHead};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// In-process blob store used by tests and local development.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    failing_puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` puts fail.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .expect("objects lock")
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) {
        self.objects.lock().expect("objects lock").insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                metadata,
                storage_class: Some("STANDARD".to_string()),
                last_modified: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let failed = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("simulated put failure for {}", key));
        }
        self.insert(bucket, key, body, metadata);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.object(bucket, key)
            .map(|o| o.body)
            .ok_or_else(|| anyhow!("no such object {}/{}", bucket, key))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        self.object(bucket, key)
            .map(|o| ObjectHead {
                storage_class: o.storage_class,
                metadata: o.metadata,
                last_modified: Some(o.last_modified),
            })
            .ok_or_else(|| anyhow!("no such object {}/{}", bucket, key))
    }

    async fn copy(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
        storage_class: Option<&str>,
    ) -> Result<DateTime<Utc>> {
        let mut objects = self.objects.lock().expect("objects lock");
        let source = objects
            .get(&(bucket.to_string(), from_key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no such object {}/{}", bucket, from_key))?;
        let now = Utc::now();
        objects.insert(
            (bucket.to_string(), to_key.to_string()),
            StoredObject {
                storage_class: storage_class
                    .map(str::to_string)
                    .or(source.storage_class.clone()),
                last_modified: now,
                ..source
            },
        );
        Ok(now)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .lock()
            .expect("objects lock")
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String> {
        Ok(format!(
            "memory://{}/{}?expires={}",
            bucket,
            key,
            expires_in.as_secs()
        ))
    }
}

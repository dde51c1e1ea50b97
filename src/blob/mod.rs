//! Durable storage for uploaded frames.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

pub mod memory;
pub mod s3;

/// User metadata keys attached to every uploaded frame.
pub mod meta {
    pub const MONITOR_NAME: &str = "zmMonitorName";
    pub const EVENT_NAME: &str = "zmEventName";
    pub const EVENT_ID: &str = "zmEventId";
    pub const FRAME_ID: &str = "zmFrameId";
    pub const FRAME_DATETIME: &str = "zmFrameDatetime";
    pub const SCORE: &str = "zmScore";
    pub const LOCAL_EVENT_PATH: &str = "zmLocalEventPath";
    pub const ALERT: &str = "alert";
    pub const LABELS: &str = "labels";
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectHead {
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectHead>;

    /// Copy within a bucket, keeping metadata. Returns the time the copy
    /// was written.
    async fn copy(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
        storage_class: Option<&str>,
    ) -> Result<DateTime<Utc>>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// A time-limited URL for fetching the object.
    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String>;
}

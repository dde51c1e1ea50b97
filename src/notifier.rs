use crate::detection::Label;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, instrument};

pub const ALARM_SUBJECT: &str = "Alarm Event detected!";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmNotification {
    pub subject: String,
    pub camera: String,
    pub event_id: i64,
    pub frame_id: i64,
    pub event_datetime: DateTime<Utc>,
    pub storage_key: String,
    pub image_url: String,
    pub labels: Vec<Label>,
    pub text: String,
}

/// Plain-text body listing each label with its face and confidence.
pub fn format_label_table(labels: &[Label]) -> String {
    let mut text = format!("{:<16}{:<16}{}\n", "Label", "Face", "Confidence");
    for label in labels {
        text.push_str(&format!(
            "{:<16}{:<16}{:.1}\n",
            label.name,
            label.face.as_deref().unwrap_or("-"),
            label.score
        ));
    }
    text
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &AlarmNotification) -> Result<()>;
}

/// Posts the notification as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, notification), fields(event_id = notification.event_id), err)]
    async fn send(&self, notification: &AlarmNotification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| anyhow!("webhook request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("webhook returned {}: {}", status, body));
        }
        Ok(())
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &AlarmNotification) -> Result<()> {
        info!(
            camera = %notification.camera,
            event_id = notification.event_id,
            frame_id = notification.frame_id,
            url = %notification.image_url,
            "{}\n{}",
            notification.subject,
            notification.text
        );
        Ok(())
    }
}

/// Records notifications for tests.
#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<AlarmNotification>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<AlarmNotification> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, notification: &AlarmNotification) -> Result<()> {
        self.sent
            .lock()
            .expect("sent lock")
            .push(notification.clone());
        Ok(())
    }
}

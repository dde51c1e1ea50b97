//! Asks the recorder-side clip service to render the video for an alarm.

use crate::query::AlarmQueryResult;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

pub const CLIP_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);
/// Alarm rows read when looking for a camera's latest event.
pub const CLIP_SEARCH_COUNT: usize = 100;
/// Frames added before the first and after the last alarm frame.
pub const CLIP_PAD_FRAMES: i64 = 20;
pub const MAX_CLIP_FRAMES: i64 = 500;
/// Frames shown either side of an alarm picked from a session list.
pub const SESSION_CLIP_FRAMES: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipRange {
    pub event_id: i64,
    pub start_frame: i64,
    pub end_frame: i64,
}

impl ClipRange {
    /// Clip of the newest event in `alarms`, which must be newest first.
    /// Spans the event's alarm frames, padded and capped in length.
    pub fn latest_event(alarms: &[AlarmQueryResult]) -> Option<Self> {
        let latest = alarms.first()?;
        let first_frame = alarms
            .iter()
            .filter(|a| a.event_id == latest.event_id)
            .map(|a| a.frame_id)
            .last()
            .unwrap_or(latest.frame_id);

        let start_frame = if first_frame < CLIP_PAD_FRAMES {
            0
        } else {
            first_frame - CLIP_PAD_FRAMES
        };
        // Short events are doubled rather than padded.
        let mut end_frame = if latest.frame_id < CLIP_PAD_FRAMES {
            latest.frame_id * 2
        } else {
            latest.frame_id + CLIP_PAD_FRAMES
        };
        if end_frame - start_frame > MAX_CLIP_FRAMES {
            end_frame = start_frame + MAX_CLIP_FRAMES;
        }
        Some(Self {
            event_id: latest.event_id,
            start_frame,
            end_frame,
        })
    }

    /// Clip around one alarm frame.
    pub fn around(alarm: &AlarmQueryResult) -> Self {
        Self {
            event_id: alarm.event_id,
            start_frame: (alarm.frame_id - SESSION_CLIP_FRAMES).max(0),
            end_frame: alarm.frame_id + SESSION_CLIP_FRAMES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone)]
pub struct ClipClient {
    client: reqwest::Client,
    url: url::Url,
    credentials: Option<(String, String)>,
}

impl ClipClient {
    pub fn new(url: &str, credentials: Option<(String, String)>) -> Result<Self> {
        let url = url::Url::parse(url)
            .with_context(|| format!("Invalid clip service URL {}", url))?;
        let client = reqwest::Client::builder()
            .timeout(CLIP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build clip service client")?;
        Ok(Self {
            client,
            url,
            credentials,
        })
    }

    /// Request URL carrying the event and frame range as query parameters.
    pub fn request_url(&self, event_id: i64, start_frame: i64, end_frame: i64) -> url::Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("event", &event_id.to_string())
            .append_pair("start_frame", &start_frame.to_string())
            .append_pair("end_frame", &end_frame.to_string());
        url
    }

    #[instrument(skip(self), err)]
    pub async fn request_clip(&self, range: ClipRange) -> Result<ClipResponse> {
        let mut request = self.client.get(self.request_url(
            range.event_id,
            range.start_frame,
            range.end_frame,
        ));
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("clip service request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("clip service returned {}", status));
        }
        let clip: ClipResponse = response
            .json()
            .await
            .context("Failed to parse clip service response")?;
        info!("Clip for event {}: {}", range.event_id, clip.message);
        Ok(clip)
    }
}

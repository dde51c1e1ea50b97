//! Remembers which events already produced a notification so a long event
//! does not notify on every frame.

use crate::detection::Label;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedAlarm {
    pub event: i64,
    pub frame: i64,
    #[serde(default)]
    pub faces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationCache {
    entries: Vec<NotifiedAlarm>,
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[NotifiedAlarm] {
        &self.entries
    }

    pub fn get(&self, event: i64) -> Option<&NotifiedAlarm> {
        self.entries.iter().find(|entry| entry.event == event)
    }

    /// True for a new event, a newly seen face, or an event that has moved
    /// more than `frame_offset` frames past the cached notification.
    pub fn should_notify(&self, alarm: &NotifiedAlarm, frame_offset: i64) -> bool {
        let Some(cached) = self.get(alarm.event) else {
            return true;
        };
        if alarm.faces.iter().any(|face| !cached.faces.contains(face)) {
            return true;
        }
        alarm.frame - cached.frame > frame_offset
    }

    /// Insert the alarm, replacing any entry for the same event.
    pub fn update(&mut self, alarm: NotifiedAlarm) {
        match self.entries.iter_mut().find(|entry| entry.event == alarm.event) {
            Some(entry) => *entry = alarm,
            None => self.entries.push(alarm),
        }
    }

    /// Load from `path`. A missing file is an empty cache.
    #[instrument(err)]
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| {
                format!("Failed to parse notification cache {}", path.display())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No notification cache at {}, starting cold", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to read notification cache {}", path.display())
            }),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.with_context(|| {
            format!("Failed to write notification cache {}", tmp.display())
        })?;
        tokio::fs::rename(&tmp, path).await.with_context(|| {
            format!("Failed to replace notification cache {}", path.display())
        })?;
        Ok(())
    }
}

/// True if any label carries a face from `allow_list`.
pub fn find_face(labels: &[Label], allow_list: &[String]) -> bool {
    labels.iter().any(|label| {
        label
            .face
            .as_ref()
            .is_some_and(|face| allow_list.iter().any(|allowed| allowed == face))
    })
}

/// Faces present in `labels`, in first-seen order.
pub fn faces_in(labels: &[Label]) -> Vec<String> {
    let mut faces: Vec<String> = Vec::new();
    for face in labels.iter().filter_map(|l| l.face.as_ref()) {
        if !faces.contains(face) {
            faces.push(face.clone());
        }
    }
    faces
}

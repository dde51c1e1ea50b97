use crate::detection::{DetectionMode, Label};
use anyhow::{Context, Result};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Processed,
    Skipped,
}

/// One record per frame the uploader looked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub image: String,
    pub labels: Vec<Label>,
    pub status: AuditStatus,
    pub detection_mode: DetectionMode,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<()>;
}

pub struct SqliteAuditLog {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAuditLog {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    #[instrument(skip(self, entry), fields(image = %entry.image), err)]
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        let document = serde_json::to_string(entry)?;
        let conn = self
            .pool
            .get()
            .context("Failed to get a zmwatch database connection")?;
        conn.execute(
            "INSERT INTO detection_audit (created_at, image, document)
             VALUES (?, ?, ?)",
            params![chrono::Utc::now().timestamp(), entry.image, document],
        )?;
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Default)]
pub struct RecordingAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("entries lock").clone()
    }
}

#[async_trait]
impl AuditLog for RecordingAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().expect("entries lock").push(entry.clone());
        Ok(())
    }
}

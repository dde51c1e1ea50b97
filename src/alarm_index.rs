//! Index of processed alarm frames, queried by camera and time.

use crate::detection::Label;
use crate::time_util::{format_zulu_millis, parse_zulu};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub camera_name: String,
    pub event_datetime: DateTime<Utc>,
    pub event_name: String,
    pub event_id: i64,
    pub frame_id: i64,
    pub storage_key: String,
    /// When the object reached its archive location.
    pub stored_at: Option<DateTime<Utc>>,
    pub local_path: Option<String>,
    pub labels: Vec<Label>,
    pub alert: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[serde(rename = "asc", alias = "ascending")]
    Ascending,
    #[default]
    #[serde(rename = "desc", alias = "descending")]
    Descending,
}

/// Position after the last row of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken {
    pub event_datetime: String,
    pub event_id: i64,
    pub frame_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub camera: String,
    pub since: DateTime<Utc>,
    pub order: SortOrder,
    pub alert_only: bool,
    pub limit: usize,
    pub start_after: Option<PageToken>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmPage {
    pub items: Vec<AlarmRecord>,
    /// Present when more rows may follow.
    pub next: Option<PageToken>,
}

#[async_trait]
pub trait AlarmIndex: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, record: &AlarmRecord) -> Result<()>;

    async fn query_page(&self, request: &PageRequest) -> Result<AlarmPage>;
}

pub struct SqliteAlarmIndex {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAlarmIndex {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &Row) -> rusqlite::Result<(AlarmRecord, String)> {
    let datetime: String = row.get(1)?;
    let stored_at: Option<String> = row.get(6)?;
    let labels: String = row.get(8)?;
    let bad_column = |idx: usize, e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    };
    let record = AlarmRecord {
        camera_name: row.get(0)?,
        event_datetime: parse_zulu(&datetime).map_err(|e| bad_column(1, e))?,
        event_name: row.get(2)?,
        event_id: row.get(3)?,
        frame_id: row.get(4)?,
        storage_key: row.get(5)?,
        stored_at: stored_at
            .as_deref()
            .map(parse_zulu)
            .transpose()
            .map_err(|e| bad_column(6, e))?,
        local_path: row.get(7)?,
        labels: serde_json::from_str(&labels)
            .map_err(|e| bad_column(8, e.into()))?,
        alert: row.get(9)?,
    };
    Ok((record, datetime))
}

#[async_trait]
impl AlarmIndex for SqliteAlarmIndex {
    #[instrument(skip(self, record), fields(key = %record.storage_key), err)]
    async fn put(&self, record: &AlarmRecord) -> Result<()> {
        let conn = self
            .pool
            .get()
            .context("Failed to get a zmwatch database connection")?;
        conn.execute(
            "INSERT OR REPLACE INTO alarm_frames (
                camera_name, event_datetime, event_name, event_id, frame_id,
                storage_key, stored_at, local_path, labels, alert
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.camera_name,
                format_zulu_millis(&record.event_datetime),
                record.event_name,
                record.event_id,
                record.frame_id,
                record.storage_key,
                record.stored_at.as_ref().map(format_zulu_millis),
                record.local_path,
                serde_json::to_string(&record.labels)?,
                record.alert,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn query_page(&self, request: &PageRequest) -> Result<AlarmPage> {
        let conn = self
            .pool
            .get()
            .context("Failed to get a zmwatch database connection")?;

        let (direction, cmp) = match request.order {
            SortOrder::Ascending => ("ASC", ">"),
            SortOrder::Descending => ("DESC", "<"),
        };
        let sql = format!(
            "SELECT camera_name, event_datetime, event_name, event_id, frame_id,
                    storage_key, stored_at, local_path, labels, alert
             FROM alarm_frames
             WHERE camera_name = ?1
               AND event_datetime > ?2
               AND (?3 = 0 OR alert = 1)
               AND (?4 IS NULL OR (event_datetime, event_id, frame_id) {cmp} (?4, ?5, ?6))
             ORDER BY event_datetime {direction}, event_id {direction}, frame_id {direction}
             LIMIT ?7"
        );

        let token = request.start_after.as_ref();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                request.camera,
                format_zulu_millis(&request.since),
                request.alert_only,
                token.map(|t| t.event_datetime.clone()),
                token.map(|t| t.event_id),
                token.map(|t| t.frame_id),
                request.limit as i64,
            ],
            record_from_row,
        )?;
        let rows: Result<Vec<_>, _> = rows.collect();
        let rows = rows?;

        let next = if rows.len() == request.limit {
            rows.last().map(|(record, datetime)| PageToken {
                event_datetime: datetime.clone(),
                event_id: record.event_id,
                frame_id: record.frame_id,
            })
        } else {
            None
        };
        debug!(
            "Alarm index page for {} returned {} rows",
            request.camera,
            rows.len()
        );
        Ok(AlarmPage {
            items: rows.into_iter().map(|(record, _)| record).collect(),
            next,
        })
    }
}

use crate::time_util::parse_recorder_timestamp;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, instrument};

/// Frame type the recorder assigns to frames captured during an alarm.
pub const ALARM_FRAME_TYPE: &str = "Alarm";

const RECORDER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A row returned by the unuploaded-frames query. Every joined column may be
/// missing in a damaged recorder database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameRow {
    pub frame_id: Option<i64>,
    pub event_id: Option<i64>,
    pub frame_timestamp: Option<String>,
    pub score: Option<i64>,
    pub delta: Option<f64>,
    pub event_name: Option<String>,
    pub event_start: Option<String>,
    pub monitor_name: Option<String>,
    pub upload_timestamp: Option<String>,
}

/// A recorder frame captured during an alarm, with all fields present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmFrame {
    pub monitor_name: String,
    pub event_id: i64,
    pub frame_id: i64,
    pub event_name: String,
    pub frame_timestamp: NaiveDateTime,
    /// Seconds since the event started; the fractional part is the
    /// sub-second offset of the frame.
    pub delta: f64,
    pub event_start: NaiveDateTime,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("bad frame (event {event_id:?}, frame {frame_id:?}): {reason}")]
pub struct BadFrame {
    pub event_id: Option<i64>,
    pub frame_id: Option<i64>,
    pub reason: String,
}

impl TryFrom<FrameRow> for AlarmFrame {
    type Error = BadFrame;

    fn try_from(row: FrameRow) -> Result<Self, Self::Error> {
        let bad = |reason: String| BadFrame {
            event_id: row.event_id,
            frame_id: row.frame_id,
            reason,
        };
        let missing = |field: &str| bad(format!("missing {}", field));

        let frame_id = row.frame_id.ok_or_else(|| missing("frame id"))?;
        let event_id = row.event_id.ok_or_else(|| missing("event id"))?;
        let monitor_name = row
            .monitor_name
            .clone()
            .ok_or_else(|| missing("monitor name"))?;
        let event_name =
            row.event_name.clone().ok_or_else(|| missing("event name"))?;
        let frame_timestamp = row
            .frame_timestamp
            .as_deref()
            .ok_or_else(|| missing("frame timestamp"))
            .and_then(|ts| {
                parse_recorder_timestamp(ts).map_err(|e| bad(e.to_string()))
            })?;
        let event_start = row
            .event_start
            .as_deref()
            .ok_or_else(|| missing("event start time"))
            .and_then(|ts| {
                parse_recorder_timestamp(ts).map_err(|e| bad(e.to_string()))
            })?;

        Ok(AlarmFrame {
            monitor_name,
            event_id,
            frame_id,
            event_name,
            frame_timestamp,
            delta: row.delta.unwrap_or(0.0),
            event_start,
            score: row.score.unwrap_or(0),
        })
    }
}

/// Read/write access to the recorder's frame tables.
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Frames of `frame_type` newer than `since` that have no upload mark,
    /// oldest event first.
    async fn find_unuploaded_frames(
        &self,
        frame_type: &str,
        limit: usize,
        since: NaiveDateTime,
    ) -> Result<Vec<FrameRow>>;

    /// Record that a frame has been uploaded. Not idempotent.
    async fn mark_uploaded(&self, frame_id: i64, event_id: i64) -> Result<()>;
}

pub struct SqliteFrameStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteFrameStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FrameStore for SqliteFrameStore {
    #[instrument(skip(self), err)]
    async fn find_unuploaded_frames(
        &self,
        frame_type: &str,
        limit: usize,
        since: NaiveDateTime,
    ) -> Result<Vec<FrameRow>> {
        let conn = self
            .pool
            .get()
            .context("Failed to get a recorder database connection")?;
        let mut stmt = conn.prepare(
            "SELECT
                f.FrameId, f.EventId, f.TimeStamp, f.Score, f.Delta,
                e.Name, e.StartTime, m.Name, au.upload_timestamp
             FROM Frames f
             JOIN Events e ON f.EventId = e.Id
             JOIN Monitors m ON e.MonitorId = m.Id
             LEFT JOIN alarm_uploaded au ON
                au.frameid = f.FrameId AND au.eventid = f.EventId
             WHERE
                f.Type = ?
                AND f.TimeStamp > ?
                AND au.upload_timestamp IS NULL
             ORDER BY f.EventId, f.FrameId
             LIMIT ?",
        )?;

        let since = since.format(RECORDER_TIMESTAMP_FORMAT).to_string();
        let rows = stmt.query_map(
            params![frame_type, since, limit as i64],
            |row| {
                Ok(FrameRow {
                    frame_id: row.get(0)?,
                    event_id: row.get(1)?,
                    frame_timestamp: row.get(2)?,
                    score: row.get(3)?,
                    delta: row.get(4)?,
                    event_name: row.get(5)?,
                    event_start: row.get(6)?,
                    monitor_name: row.get(7)?,
                    upload_timestamp: row.get(8)?,
                })
            },
        )?;
        let rows: Result<Vec<_>, _> = rows.collect();
        let rows = rows?;

        debug!("Found {} unuploaded {} frames", rows.len(), frame_type);
        Ok(rows)
    }

    #[instrument(skip(self), err)]
    async fn mark_uploaded(&self, frame_id: i64, event_id: i64) -> Result<()> {
        let conn = self
            .pool
            .get()
            .context("Failed to get a recorder database connection")?;
        conn.execute(
            "INSERT INTO alarm_uploaded (frameid, eventid, upload_timestamp)
             VALUES (?, ?, datetime('now', 'localtime'))",
            params![frame_id, event_id],
        )?;
        Ok(())
    }
}

/// Create the upload mark table in the recorder database if it is missing.
pub fn init_frames_db(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS alarm_uploaded (
            frameid INTEGER NOT NULL,
            eventid INTEGER NOT NULL,
            upload_timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_alarm_uploaded_frame
            ON alarm_uploaded(frameid, eventid)",
        [],
    )?;
    Ok(())
}

/// Create the subset of the recorder schema the uploader reads.
pub fn init_frames_db_for_testing(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Monitors (
            Id INTEGER PRIMARY KEY,
            Name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS Events (
            Id INTEGER PRIMARY KEY,
            MonitorId INTEGER NOT NULL,
            Name TEXT,
            StartTime TEXT
        );
        CREATE TABLE IF NOT EXISTS Frames (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            EventId INTEGER NOT NULL,
            FrameId INTEGER NOT NULL,
            Type TEXT NOT NULL,
            TimeStamp TEXT,
            Delta REAL,
            Score INTEGER
        );",
    )?;
    init_frames_db(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn setup() -> SqliteFrameStore {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).unwrap();
        let mut conn = pool.get().unwrap();
        init_frames_db_for_testing(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO Monitors (Id, Name) VALUES (1, 'FrontPorch');
             INSERT INTO Events (Id, MonitorId, Name, StartTime)
                VALUES (123, 1, 'New Event', '2018-06-20 09:19:50');
             INSERT INTO Frames (EventId, FrameId, Type, TimeStamp, Delta, Score)
                VALUES (123, 45, 'Alarm', '2018-06-20 09:20:04', 12.34, 17);
             INSERT INTO Frames (EventId, FrameId, Type, TimeStamp, Delta, Score)
                VALUES (123, 46, 'Normal', '2018-06-20 09:20:05', 12.54, 0);
             INSERT INTO Frames (EventId, FrameId, Type, TimeStamp, Delta, Score)
                VALUES (123, 1, 'Alarm', '2018-06-20 08:00:00', 0.0, 3);",
        )
        .unwrap();
        drop(conn);
        SqliteFrameStore::new(pool)
    }

    fn since() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 6, 20)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_find_and_mark() {
        let store = setup();
        let rows = store
            .find_unuploaded_frames(ALARM_FRAME_TYPE, 10, since())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let frame = AlarmFrame::try_from(rows[0].clone()).unwrap();
        assert_eq!(frame.monitor_name, "FrontPorch");
        assert_eq!(frame.event_id, 123);
        assert_eq!(frame.frame_id, 45);
        assert_eq!(frame.event_name, "New Event");
        assert_eq!(frame.score, 17);

        store.mark_uploaded(45, 123).await.unwrap();
        let rows = store
            .find_unuploaded_frames(ALARM_FRAME_TYPE, 10, since())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_row_missing_fields_is_bad_frame() {
        let row = FrameRow {
            frame_id: Some(7),
            event_id: Some(9),
            frame_timestamp: None,
            event_name: Some("x".into()),
            event_start: Some("2018-06-20 09:19:50".into()),
            monitor_name: Some("FrontPorch".into()),
            ..Default::default()
        };
        let err = AlarmFrame::try_from(row).unwrap_err();
        assert_eq!(err.event_id, Some(9));
        assert_eq!(err.frame_id, Some(7));
        assert!(err.reason.contains("frame timestamp"));

        let row = FrameRow {
            frame_id: Some(7),
            event_id: Some(9),
            frame_timestamp: Some("not a time".into()),
            event_name: Some("x".into()),
            event_start: Some("2018-06-20 09:19:50".into()),
            monitor_name: Some("FrontPorch".into()),
            ..Default::default()
        };
        assert!(AlarmFrame::try_from(row).is_err());
    }
}

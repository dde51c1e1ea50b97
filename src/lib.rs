use crate::alarm_index::{AlarmIndex, SqliteAlarmIndex};
use crate::blob::memory::MemoryBlobStore;
use crate::blob::BlobStore;
use crate::clip::ClipClient;
use crate::config::{CameraConfig, FaceConfig, PipelineConfig};
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;

pub mod alarm_index;
pub mod alerts;
pub mod app;
pub mod audit;
pub mod blob;
pub mod cli;
pub mod clip;
pub mod config;
pub mod detection;
pub mod downstream;
pub mod frame_store;
pub mod keys;
pub mod notifier;
pub mod notify_cache;
pub mod query;
pub mod session;
pub mod time_util;
pub mod upload;
pub mod voice;

pub mod test_utils;

/// Counters published by the upload loop.
#[derive(Debug, Default)]
pub struct ServiceStats {
    pub cycles: AtomicU64,
    pub frames_found: AtomicU64,
    pub frames_processed: AtomicU64,
    pub frames_uploaded: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub bad_frames: AtomicU64,
    pub error_count: AtomicU64,
    pub total_processing_time_ms: AtomicU64,
    /// Frames per second of the last cycle that processed anything, x1000.
    pub last_cycle_fps_milli: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub frames_found: u64,
    pub frames_processed: u64,
    pub frames_uploaded: u64,
    pub frames_skipped: u64,
    pub bad_frames: u64,
    pub error_count: u64,
    pub total_processing_time_ms: u64,
    pub last_cycle_fps: f64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            frames_found: self.frames_found.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_uploaded: self.frames_uploaded.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            bad_frames: self.bad_frames.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            total_processing_time_ms: self
                .total_processing_time_ms
                .load(Ordering::Relaxed),
            last_cycle_fps: self.last_cycle_fps_milli.load(Ordering::Relaxed)
                as f64
                / 1000.0,
        }
    }
}

// Define the AppState struct for both main app and testing
pub struct AppState {
    pub frames_db: Pool<SqliteConnectionManager>,
    pub zmwatch_db: Pool<SqliteConnectionManager>,
    pub config: Arc<PipelineConfig>,
    pub timezone: chrono_tz::Tz,
    pub bucket: String,
    /// Answer with recorder paths instead of signed URLs.
    pub use_local_path: bool,
    pub signed_url_ttl: Duration,
    pub blob_store: Arc<dyn BlobStore>,
    pub alarm_index: Arc<dyn AlarmIndex>,
    pub stats: Arc<ServiceStats>,
    pub sessions: Arc<session::Store>,
    pub clip_client: Option<ClipClient>,
    pub page_size: usize,
    pub shutdown_token: CancellationToken,
    #[allow(dead_code)]
    temp_frames_path: Option<tempfile::NamedTempFile>,
    #[allow(dead_code)]
    temp_zmwatch_path: Option<tempfile::NamedTempFile>,
}

/// Cameras and faces used by test states.
pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        cameras: vec![
            CameraConfig {
                name: "FrontPorch".to_string(),
                aliases: vec!["front porch".to_string(), "front".to_string()],
            },
            CameraConfig {
                name: "Garage".to_string(),
                aliases: vec!["garage".to_string()],
            },
            CameraConfig {
                name: "Backyard".to_string(),
                aliases: vec!["back yard".to_string(), "backyard".to_string()],
            },
        ],
        faces: vec![
            FaceConfig {
                database_name: "alice".to_string(),
                aliases: vec!["Alice".to_string(), "mum".to_string()],
                as_object: false,
            },
            FaceConfig {
                database_name: "dog".to_string(),
                aliases: vec!["Rex".to_string()],
                as_object: true,
            },
        ],
        find_faces: vec!["alice".to_string()],
        ..PipelineConfig::default()
    }
}

impl AppState {
    pub fn new_for_testing() -> Self {
        Self::new_for_testing_with_blob_store(Arc::new(MemoryBlobStore::new()))
    }

    // Create a new AppState for testing with minimal configuration
    pub fn new_for_testing_with_blob_store(
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        // Create temporary files for SQLite databases
        let temp_frames_file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary frames database file");
        let temp_zmwatch_file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary zmwatch database file");

        let frames_path = temp_frames_file
            .path()
            .to_str()
            .expect("Failed to get frames temp file path")
            .to_string();
        let zmwatch_path = temp_zmwatch_file
            .path()
            .to_str()
            .expect("Failed to get zmwatch temp file path")
            .to_string();

        let frames_pool = Pool::new(SqliteConnectionManager::file(&frames_path))
            .expect("Failed to create frames pool");
        let zmwatch_pool =
            Pool::new(SqliteConnectionManager::file(&zmwatch_path))
                .expect("Failed to create zmwatch pool");

        let mut zmwatch_conn =
            zmwatch_pool.get().expect("Failed to get connection");
        init_zmwatch_db(&mut zmwatch_conn)
            .expect("Failed to initialize zmwatch db");

        let mut frames_conn =
            frames_pool.get().expect("Failed to get connection");
        frame_store::init_frames_db_for_testing(&mut frames_conn)
            .expect("Failed to initialize frames db");

        Self {
            frames_db: frames_pool,
            alarm_index: Arc::new(SqliteAlarmIndex::new(zmwatch_pool.clone())),
            zmwatch_db: zmwatch_pool,
            config: Arc::new(test_pipeline_config()),
            // Use Adelaide timezone for tests because it is an odd timezone,
            // being offset from UTC by 9.5 hours
            timezone: chrono_tz::Australia::Adelaide,
            bucket: "test-bucket".to_string(),
            use_local_path: false,
            signed_url_ttl: Duration::from_secs(60),
            blob_store,
            stats: Arc::new(ServiceStats::new()),
            sessions: Arc::new(session::Store::new()),
            clip_client: None,
            page_size: query::DEFAULT_PAGE_SIZE,
            shutdown_token: CancellationToken::new(),
            // Store temp files so they're cleaned up when AppState is dropped
            temp_frames_path: Some(temp_frames_file),
            temp_zmwatch_path: Some(temp_zmwatch_file),
        }
    }
}

// Create a config struct to hold AppState configuration
pub struct AppConfig {
    pub frames_pool: Pool<SqliteConnectionManager>,
    pub zmwatch_pool: Pool<SqliteConnectionManager>,
    pub config: PipelineConfig,
    pub timezone_str: Option<String>,
    pub bucket: String,
    pub use_local_path: bool,
    pub blob_store: Arc<dyn BlobStore>,
    pub clip_client: Option<ClipClient>,
    pub page_size: usize,
}

// Function to create AppState from parameters
pub fn create_app_state(config: AppConfig) -> Arc<AppState> {
    let timezone =
        time_util::get_local_timezone(config.timezone_str.as_deref());
    info!("Using timezone {}", timezone);

    Arc::new(AppState {
        alarm_index: Arc::new(SqliteAlarmIndex::new(config.zmwatch_pool.clone())),
        frames_db: config.frames_pool,
        zmwatch_db: config.zmwatch_pool,
        config: Arc::new(config.config),
        timezone,
        bucket: config.bucket,
        use_local_path: config.use_local_path,
        signed_url_ttl: Duration::from_secs(60),
        blob_store: config.blob_store,
        stats: Arc::new(ServiceStats::new()),
        sessions: Arc::new(session::Store::new()),
        clip_client: config.clip_client,
        page_size: config.page_size,
        shutdown_token: CancellationToken::new(),
        temp_frames_path: None,
        temp_zmwatch_path: None,
    })
}

fn zmwatch_migration_steps() -> Vec<M<'static>> {
    vec![
        M::up(
            r#"
            CREATE TABLE IF NOT EXISTS alarm_frames (
                camera_name TEXT NOT NULL,
                event_datetime TEXT NOT NULL,   -- ISO-8601 UTC, millisecond precision
                event_name TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                frame_id INTEGER NOT NULL,
                storage_key TEXT NOT NULL,
                stored_at TEXT,
                local_path TEXT,
                labels TEXT NOT NULL,           -- JSON array of labels
                alert INTEGER NOT NULL,
                PRIMARY KEY (camera_name, event_datetime, event_id, frame_id)
            );
            CREATE TABLE IF NOT EXISTS detection_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                image TEXT NOT NULL,
                document TEXT NOT NULL
            );
            "#,
        ),
        M::up(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alarm_frames_alert
                ON alarm_frames(camera_name, alert, event_datetime);
            CREATE INDEX IF NOT EXISTS idx_detection_audit_image
                ON detection_audit(image);
            "#,
        ),
    ]
}

fn apply_zmwatch_migrations(conn: &mut Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    let migrations = Migrations::new(zmwatch_migration_steps());
    migrations.to_latest(conn)?;
    Ok(())
}

// Database initialization
#[instrument]
pub fn init_zmwatch_db(conn: &mut Connection) -> Result<()> {
    info!("Initializing zmwatch database");
    apply_zmwatch_migrations(conn)?;
    Ok(())
}

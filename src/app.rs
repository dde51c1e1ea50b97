use crate::blob::s3::S3BlobStore;
use crate::blob::BlobStore;
use crate::cli::Args;
use crate::clip::ClipClient;
use crate::config::PipelineConfig;
use crate::detection::faces::SubprocessFaceRecognizer;
use crate::detection::local::LocalDetectionClient;
use crate::detection::remote::RekognitionDetector;
use crate::detection::{
    DetectionBackend, DetectionMode, Dispatcher, FaceRecognizer,
    StoredImageDetector,
};
use crate::downstream::{run_worker, ChainContext, UploadedObject};
use crate::frame_store::{init_frames_db, SqliteFrameStore};
use crate::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::upload::Uploader;
use crate::voice::{
    self, AlarmListResponse, AlarmResponse, AlarmsParams, ClipView, QueryError,
};
use crate::{AppState, StatsSnapshot};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use fs2::FileExt as Fs2FileExt;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::compression::predicate::{
    NotForContentType, Predicate, SizeAbove,
};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{prelude::*, Registry};
use tracing_tree::HierarchicalLayer;

const DOWNSTREAM_QUEUE_DEPTH: usize = 1024;
const SESSION_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub timezone: String,
    pub bucket: String,
    pub active_sessions: usize,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    pub camera: Option<String>,
    pub who: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClipRequest {
    pub camera: Option<String>,
}

// Health check endpoint
#[instrument]
pub async fn health_check() -> &'static str {
    debug!("Health check requested");
    "OK"
}

#[instrument(level = "debug")]
fn check_file_is_writable(path: &std::path::Path, file_type: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(anyhow::anyhow!(
                "Directory for {} at '{}' does not exist. Please create it manually.",
                file_type,
                parent.display()
            ));
        }
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path);
    if let Err(e) = file {
        return Err(anyhow::anyhow!(
            "Cannot write to {} at '{}': {}. Please check file permissions.",
            file_type,
            path.display(),
            e
        ));
    }
    Ok(())
}

#[axum::debug_handler]
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        timezone: state.timezone.to_string(),
        bucket: state.bucket.clone(),
        active_sessions: state.sessions.len().await,
        stats: state.stats.snapshot(),
    })
}

#[axum::debug_handler]
async fn get_alarms(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlarmsParams>,
) -> Result<Json<AlarmListResponse>, QueryError> {
    Ok(Json(voice::list_alarms(&state, &params).await?))
}

#[axum::debug_handler]
async fn get_latest_alarm(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LatestParams>,
) -> Result<Json<AlarmResponse>, QueryError> {
    Ok(Json(
        voice::latest_alarm(
            &state,
            params.camera.as_deref(),
            params.who.as_deref(),
        )
        .await?,
    ))
}

#[axum::debug_handler]
async fn post_session_alarms(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
    Json(params): Json<AlarmsParams>,
) -> Result<Json<AlarmListResponse>, QueryError> {
    Ok(Json(
        voice::store_session_alarms(&state, &session, &params).await?,
    ))
}

#[axum::debug_handler]
async fn get_session_alarm(
    State(state): State<Arc<AppState>>,
    Path((session, selection)): Path<(String, usize)>,
) -> Result<Json<AlarmResponse>, QueryError> {
    Ok(Json(
        voice::select_session_alarm(&state, &session, selection).await?,
    ))
}

#[axum::debug_handler]
async fn post_clip(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClipRequest>,
) -> Result<Json<ClipView>, QueryError> {
    let range = voice::latest_clip_range(&state, request.camera.as_deref()).await?;
    Ok(Json(voice::request_clip(&state, range).await?))
}

#[axum::debug_handler]
async fn post_session_clip(
    State(state): State<Arc<AppState>>,
    Path((session, selection)): Path<(String, usize)>,
) -> Result<Json<ClipView>, QueryError> {
    let range = voice::session_clip_range(&state, &session, selection).await?;
    Ok(Json(voice::request_clip(&state, range).await?))
}

fn create_app_lock(path: &std::path::Path) -> Result<File> {
    let lock_file = File::create(path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("Another uploader is already running"))?;
    Ok(lock_file)
}

pub fn routes(state: Arc<AppState>) -> Router {
    let predicate = SizeAbove::new(32)
        // still don't compress gRPC
        .and(NotForContentType::GRPC)
        // still don't compress images
        .and(NotForContentType::IMAGES);

    let compression_layer = CompressionLayer::new()
        .br(true)
        .deflate(true)
        .gzip(true)
        .zstd(true)
        .compress_when(predicate);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/alarms", get(get_alarms))
        .route("/api/alarms/latest", get(get_latest_alarm))
        .route("/api/sessions/{id}/alarms", post(post_session_alarms))
        .route("/api/sessions/{id}/alarms/{n}", get(get_session_alarm))
        .route("/api/sessions/{id}/alarms/{n}/clip", post(post_session_clip))
        .route("/api/clip", post(post_clip))
        .layer(compression_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the uploader and downstream worker from the arguments.
fn build_pipeline(
    args: &Args,
    state: &AppState,
    blob_store: Arc<dyn BlobStore>,
) -> Result<(Uploader, Option<(ChainContext, mpsc::Receiver<UploadedObject>)>)>
{
    let rekognition = Arc::new(RekognitionDetector::new(
        args.aws_region.clone(),
        args.min_confidence,
    ));
    let backend: Arc<dyn DetectionBackend> = match args.detection_mode {
        DetectionMode::Local => Arc::new(LocalDetectionClient::new(
            args.detector_url.clone(),
            Duration::from_secs(args.detector_heartbeat_secs),
        )?),
        DetectionMode::Remote => rekognition.clone(),
    };
    let faces: Option<Arc<dyn FaceRecognizer>> = args
        .face_program
        .as_ref()
        .map(|program| {
            Arc::new(SubprocessFaceRecognizer::new(program.clone()))
                as Arc<dyn FaceRecognizer>
        });
    let dispatcher = Dispatcher::new(backend, faces);

    let settings = args.upload_settings(state.timezone, &state.config)?;
    let store = Arc::new(SqliteFrameStore::new(state.frames_db.clone()));
    let mut uploader = Uploader::new(
        store,
        blob_store.clone(),
        dispatcher,
        settings,
        state.stats.clone(),
    );
    if args.audit_log {
        uploader = uploader.with_audit(Arc::new(crate::audit::SqliteAuditLog::new(
            state.zmwatch_db.clone(),
        )));
    }

    if !args.enable_downstream {
        return Ok((uploader, None));
    }

    let (tx, rx) = mpsc::channel(DOWNSTREAM_QUEUE_DEPTH);
    uploader = uploader.with_downstream(tx);

    let notifier: Arc<dyn Notifier> = match &args.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };
    let assessor: Option<Arc<dyn StoredImageDetector>> =
        match args.detection_mode {
            DetectionMode::Remote => {
                Some(rekognition as Arc<dyn StoredImageDetector>)
            }
            DetectionMode::Local => None,
        };
    let ctx = ChainContext {
        blob: blob_store,
        index: state.alarm_index.clone(),
        assessor,
        notifier,
        cache_path: args.cache_file.clone(),
        config: state.config.clone(),
        timezone: state.timezone,
    };
    Ok((uploader, Some((ctx, rx))))
}

pub async fn serve() -> Result<()> {
    // Initialize logging with tracing
    let subscriber = Registry::default()
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        );

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Parse command line arguments
    let args = Args::parse();

    // Held for the life of the process
    let _lock_file = if args.enable_upload {
        Some(create_app_lock(&args.lock_file).map_err(|e| {
            error!("Failed to create lock file: {}", e);
            e
        })?)
    } else {
        None
    };

    info!("Starting zmwatch service");

    let config = PipelineConfig::load(args.config.as_deref())?;

    // Initialize database connection pools
    info!("Creating database connection pools");
    let frames_pool =
        Pool::new(SqliteConnectionManager::file(&args.frames_db))?;
    {
        let mut conn = frames_pool.get()?;
        init_frames_db(&mut conn)?;
    }

    info!("Checking if zmwatch database is writable");
    check_file_is_writable(&args.zmwatch_db, "zmwatch database")?;
    let zmwatch_pool =
        Pool::new(SqliteConnectionManager::file(&args.zmwatch_db))?;
    {
        let mut conn = zmwatch_pool.get()?;
        crate::init_zmwatch_db(&mut conn)?;
    }

    let blob_store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(
        args.aws_region.clone(),
        args.s3_endpoint_url.clone(),
    ));
    let clip_client = match &args.clip_url {
        Some(url) => Some(ClipClient::new(url, args.clip_credentials())?),
        None => None,
    };

    let state = crate::create_app_state(crate::AppConfig {
        frames_pool,
        zmwatch_pool,
        config,
        timezone_str: args.timezone.clone(),
        bucket: args.bucket.clone(),
        use_local_path: args.use_local_path,
        blob_store: blob_store.clone(),
        clip_client,
        page_size: args.page_size,
    });
    let shutdown = state.shutdown_token.clone();

    // Set up ctrl-c handler
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL-C, initiating shutdown");
            ctrl_c_token.cancel();
        }
    });

    let mut handles: Vec<(&str, JoinHandle<Result<()>>)> = Vec::new();

    if args.enable_upload {
        let (uploader, downstream) = build_pipeline(&args, &state, blob_store)?;
        if let Some((ctx, rx)) = downstream {
            info!("Starting downstream worker");
            let token = shutdown.clone();
            handles.push((
                "downstream",
                tokio::spawn(async move {
                    run_worker(Arc::new(ctx), rx, token).await;
                    Ok(())
                }),
            ));
        }
        info!("Starting upload loop");
        let uploader = Arc::new(uploader);
        let token = shutdown.clone();
        handles.push((
            "upload",
            tokio::spawn(async move {
                let result = uploader.run(token.clone()).await;
                if let Err(e) = &result {
                    error!("Upload loop failed: {:#}", e);
                    token.cancel();
                }
                result
            }),
        ));
    } else {
        info!("Upload loop disabled");
    }

    let gc_state = state.clone();
    let gc_token = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_GC_INTERVAL);
        loop {
            tokio::select! {
                _ = gc_token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = gc_state.sessions.garbage_collect().await;
                    if removed > 0 {
                        debug!("Dropped {} expired sessions", removed);
                    }
                }
            }
        }
    });

    // Start web server
    let app = routes(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    let server_token = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
    {
        error!("Server error: {}", e);
    }
    shutdown.cancel();
    info!("Shutdown signal received, waiting for background tasks to complete...");

    let mut failure = None;
    for (task_name, handle) in handles {
        match tokio::time::timeout(Duration::from_secs(30), handle).await {
            Ok(Ok(Ok(()))) => {
                info!("Background {} completed gracefully", task_name)
            }
            Ok(Ok(Err(e))) => failure = Some(e),
            Ok(Err(e)) => {
                failure = Some(anyhow::anyhow!("{} task panicked: {}", task_name, e))
            }
            Err(_) => {
                warn!("Background {} timed out during shutdown", task_name)
            }
        }
    }

    info!("Server shutdown complete");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

//! Work done on each frame after it lands in blob storage: label
//! assessment, archival, indexing and notification.

use crate::alarm_index::{AlarmIndex, AlarmRecord};
use crate::alerts::evaluate_labels;
use crate::blob::{meta, BlobStore};
use crate::config::PipelineConfig;
use crate::detection::{Label, StoredImageDetector};
use crate::keys::{archive_key, parse_storage_key};
use crate::notifier::{
    format_label_table, AlarmNotification, Notifier, ALARM_SUBJECT,
};
use crate::notify_cache::{faces_in, find_face, NotificationCache, NotifiedAlarm};
use crate::time_util::local_to_utc_lenient;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const NOTIFICATION_URL_TTL: Duration = Duration::from_secs(60);

/// Channel message announcing a freshly uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepInput {
    pub bucket: String,
    pub key: String,
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
    pub alert: Option<bool>,
    pub labels: Option<Vec<Label>>,
    /// The uploader already decided `alert`.
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedObject {
    pub key: String,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    NoMatchingFace,
    Suppressed,
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub archived: ArchivedObject,
    pub alert: bool,
    pub record: Option<AlarmRecord>,
    pub notified: Option<NotifyOutcome>,
}

pub struct ChainContext {
    pub blob: Arc<dyn BlobStore>,
    pub index: Arc<dyn AlarmIndex>,
    /// Label service for objects uploaded without an alert decision.
    pub assessor: Option<Arc<dyn StoredImageDetector>>,
    pub notifier: Arc<dyn Notifier>,
    pub cache_path: PathBuf,
    pub config: Arc<PipelineConfig>,
    pub timezone: Tz,
}

#[instrument(skip(ctx), err)]
pub async fn trigger(ctx: &ChainContext, object: &UploadedObject) -> Result<StepInput> {
    let head = ctx.blob.head(&object.bucket, &object.key).await?;
    let alert = head.metadata.get(meta::ALERT).map(|v| v == "true");
    let labels = match head.metadata.get(meta::LABELS) {
        Some(raw) => Some(
            serde_json::from_str::<Vec<Label>>(raw)
                .with_context(|| format!("bad labels metadata on {}", object.key))?,
        ),
        None => None,
    };
    Ok(StepInput {
        bucket: object.bucket.clone(),
        key: object.key.clone(),
        storage_class: head.storage_class,
        local: alert.is_some(),
        alert,
        labels,
        metadata: head.metadata,
    })
}

/// Run the remote label service when the uploader did not decide.
#[instrument(skip(ctx, input), fields(key = %input.key), err)]
pub async fn assess(ctx: &ChainContext, mut input: StepInput) -> Result<StepInput> {
    if input.local {
        return Ok(input);
    }
    let assessor = ctx
        .assessor
        .as_ref()
        .ok_or_else(|| anyhow!("no label service configured for {}", input.key))?;
    let labels = assessor.detect_stored(&input.bucket, &input.key).await?;
    let alert = evaluate_labels(&labels, &ctx.config.trigger_words);
    debug!("Assessed {} labels, alert={}", labels.len(), alert);
    input.alert = Some(alert);
    input.labels = Some(labels);
    Ok(input)
}

/// Move the object under `archive/alerts/` or `archive/falsepositives/`.
#[instrument(skip(ctx, input), fields(key = %input.key), err)]
pub async fn archive(ctx: &ChainContext, input: &StepInput) -> Result<ArchivedObject> {
    let new_key = archive_key(&input.key, input.alert.unwrap_or(false));
    let archived_at = ctx
        .blob
        .copy(
            &input.bucket,
            &input.key,
            &new_key,
            input.storage_class.as_deref(),
        )
        .await?;
    ctx.blob.delete(&input.bucket, &input.key).await?;
    Ok(ArchivedObject {
        key: new_key,
        archived_at,
    })
}

/// Index an alert frame. Non-alert frames are not indexed.
#[instrument(skip(ctx, input), fields(key = %archived.key), err)]
pub async fn store_metadata(
    ctx: &ChainContext,
    input: &StepInput,
    archived: &ArchivedObject,
) -> Result<Option<AlarmRecord>> {
    if input.alert != Some(true) {
        return Ok(None);
    }
    let parsed = parse_storage_key(&archived.key)?;
    let record = AlarmRecord {
        camera_name: parsed.camera,
        event_datetime: local_to_utc_lenient(&parsed.local_datetime, ctx.timezone)?,
        event_name: parsed.event_name,
        event_id: parsed.event_id,
        frame_id: parsed.frame_id,
        storage_key: archived.key.clone(),
        stored_at: Some(archived.archived_at),
        local_path: input.metadata.get(meta::LOCAL_EVENT_PATH).cloned(),
        labels: input.labels.clone().unwrap_or_default(),
        alert: true,
    };
    ctx.index.put(&record).await?;
    Ok(Some(record))
}

/// Notify about an indexed alert when it shows a wanted face and the dedup
/// cache allows it.
#[instrument(skip(ctx, record), fields(key = %record.storage_key), err)]
pub async fn notify(
    ctx: &ChainContext,
    bucket: &str,
    record: &AlarmRecord,
) -> Result<NotifyOutcome> {
    if !find_face(&record.labels, &ctx.config.find_faces) {
        return Ok(NotifyOutcome::NoMatchingFace);
    }

    let mut cache = NotificationCache::load(&ctx.cache_path).await?;
    let alarm = NotifiedAlarm {
        event: record.event_id,
        frame: record.frame_id,
        faces: faces_in(&record.labels),
    };
    if !cache.should_notify(&alarm, ctx.config.frame_offset) {
        debug!("Notification for event {} suppressed", record.event_id);
        return Ok(NotifyOutcome::Suppressed);
    }

    let image_url = ctx
        .blob
        .signed_url(bucket, &record.storage_key, NOTIFICATION_URL_TTL)
        .await?;
    let notification = AlarmNotification {
        subject: ALARM_SUBJECT.to_string(),
        camera: record.camera_name.clone(),
        event_id: record.event_id,
        frame_id: record.frame_id,
        event_datetime: record.event_datetime,
        storage_key: record.storage_key.clone(),
        image_url,
        labels: record.labels.clone(),
        text: format_label_table(&record.labels),
    };
    ctx.notifier.send(&notification).await?;

    cache.update(alarm);
    cache.save(&ctx.cache_path).await?;
    info!(
        "Notified about event {} frame {} on {}",
        record.event_id, record.frame_id, record.camera_name
    );
    Ok(NotifyOutcome::Sent)
}

pub async fn process_uploaded(
    ctx: &ChainContext,
    object: &UploadedObject,
) -> Result<ChainOutcome> {
    let input = trigger(ctx, object).await?;
    let input = assess(ctx, input.clone())
        .await
        .with_context(|| format!("assess failed for {:?}", input))?;
    let archived = archive(ctx, &input)
        .await
        .with_context(|| format!("archive failed for {:?}", input))?;
    let record = store_metadata(ctx, &input, &archived)
        .await
        .with_context(|| format!("store metadata failed for {:?}", input))?;
    let notified = match &record {
        Some(record) => Some(
            notify(ctx, &input.bucket, record)
                .await
                .with_context(|| format!("notify failed for {:?}", record))?,
        ),
        None => None,
    };
    Ok(ChainOutcome {
        archived,
        alert: input.alert.unwrap_or(false),
        record,
        notified,
    })
}

/// Process uploaded objects one at a time until the channel closes or
/// shutdown is requested. Failures are logged and the worker moves on.
pub async fn run_worker(
    ctx: Arc<ChainContext>,
    mut rx: mpsc::Receiver<UploadedObject>,
    shutdown: CancellationToken,
) {
    info!("Starting downstream worker");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down downstream worker");
                break;
            }
            message = rx.recv() => {
                let Some(object) = message else {
                    warn!("Upload channel closed, stopping downstream worker");
                    break;
                };
                match process_uploaded(&ctx, &object).await {
                    Ok(outcome) => debug!(
                        "Archived {} (alert={}, notified={:?})",
                        outcome.archived.key, outcome.alert, outcome.notified
                    ),
                    Err(e) => error!("Downstream chain failed for {}: {:#}", object.key, e),
                }
            }
        }
    }
}

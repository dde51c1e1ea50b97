//! Polls the recorder for new alarm frames, runs detection on them and
//! uploads the ones worth keeping.
//!
//! A cycle moves through [`CycleState`]s: it polls for unuploaded frames,
//! splits them into batches of at most `max_concurrent_upload`, runs
//! detection on each batch, uploads every frame of the batch concurrently
//! and then marks them uploaded. Batches and cycles run one at a time.

use crate::alerts::{evaluate_labels, qualifying_labels};
use crate::audit::{AuditEntry, AuditLog, AuditStatus};
use crate::blob::{meta, BlobStore};
use crate::detection::{
    plan_sampling, DetectionMode, Dispatcher, Label, SampleDecision,
};
use crate::downstream::UploadedObject;
use crate::frame_store::{AlarmFrame, FrameStore, ALARM_FRAME_TYPE};
use crate::keys::{
    build_local_path, build_storage_key, subsecond_millis, upload_key,
    DEFAULT_FRAME_ID_WIDTH,
};
use crate::time_util::{format_zulu_millis, local_to_utc_lenient};
use crate::ServiceStats;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Polling,
    Batching,
    Detecting,
    Uploading,
    Marking,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// The next poll tick retries the cycle.
    #[error("transient upload failure: {0:#}")]
    Transient(anyhow::Error),
    /// The process must stop.
    #[error("fatal upload failure: {0:#}")]
    Fatal(anyhow::Error),
}

impl CycleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Fatal(_))
    }
}

/// Keep the more severe of two failures.
fn worse(current: Option<CycleError>, next: CycleError) -> Option<CycleError> {
    match current {
        Some(existing) if existing.is_fatal() || !next.is_fatal() => Some(existing),
        _ => Some(next),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub detection_mode: DetectionMode,
    pub face_recognition: bool,
    pub audit_log: bool,
    pub keep_false_positives: bool,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub frame_type: String,
    pub max_records: usize,
    pub max_concurrent_upload: usize,
    pub frame_skip: u32,
    pub image_base_path: String,
    pub frame_id_width: usize,
    pub bucket: String,
    pub poll_interval: Duration,
    pub max_not_ready_checks: u32,
    pub max_consecutive_failures: u32,
    /// Only frames newer than this recorder-local time are considered.
    pub since: NaiveDateTime,
    pub timezone: Tz,
    /// Label names that make a locally detected frame an alert.
    pub alert_labels: Vec<String>,
    pub min_label_score: f64,
    /// Words that make a remotely labelled frame an alert.
    pub trigger_words: Vec<String>,
    pub keep_false_positives: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            frame_type: ALARM_FRAME_TYPE.to_string(),
            max_records: 400,
            max_concurrent_upload: 10,
            frame_skip: 0,
            image_base_path: "/nvr/zoneminder/events".to_string(),
            frame_id_width: DEFAULT_FRAME_ID_WIDTH,
            bucket: "zm-alarm-frames".to_string(),
            poll_interval: Duration::from_millis(500),
            max_not_ready_checks: 120,
            max_consecutive_failures: 10,
            since: DateTime::UNIX_EPOCH.naive_utc(),
            timezone: chrono_tz::America::Los_Angeles,
            alert_labels: Vec::new(),
            min_label_score: 0.0,
            trigger_words: Vec::new(),
            keep_false_positives: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sampled out; marked without detection.
    Skipped,
    FalsePositive { uploaded: bool },
    Alert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub event_id: i64,
    pub frame_id: i64,
    pub local_path: String,
    pub key: String,
    pub labels: Vec<Label>,
    pub disposition: Disposition,
}

impl FrameOutcome {
    fn uploaded(&self) -> bool {
        matches!(
            self.disposition,
            Disposition::Alert | Disposition::FalsePositive { uploaded: true }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub found: usize,
    pub processed: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub bad: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// State and counters of one running cycle.
struct Cycle {
    state: CycleState,
    started: Instant,
    report: CycleReport,
}

impl Cycle {
    fn start() -> Self {
        Self {
            state: CycleState::Idle,
            started: Instant::now(),
            report: CycleReport::default(),
        }
    }

    fn enter(&mut self, next: CycleState) {
        debug!("Upload cycle {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn finish(mut self) -> CycleReport {
        self.enter(CycleState::Idle);
        self.report.elapsed = self.started.elapsed();
        self.report
    }
}

/// Counts poll ticks that found the previous cycle still running and
/// consecutive transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTracker {
    not_ready_checks: u32,
    consecutive_failures: u32,
    max_not_ready_checks: u32,
    max_consecutive_failures: u32,
}

impl PollTracker {
    pub fn new(max_not_ready_checks: u32, max_consecutive_failures: u32) -> Self {
        Self {
            not_ready_checks: 0,
            consecutive_failures: 0,
            max_not_ready_checks,
            max_consecutive_failures,
        }
    }

    pub fn on_not_ready(&mut self) -> Result<()> {
        self.not_ready_checks += 1;
        if self.not_ready_checks > self.max_not_ready_checks {
            return Err(anyhow!(
                "upload cycle has not completed after {} checks",
                self.not_ready_checks
            ));
        }
        Ok(())
    }

    pub fn on_completed(&mut self) {
        self.not_ready_checks = 0;
        self.consecutive_failures = 0;
    }

    pub fn on_transient_failure(&mut self) -> Result<()> {
        self.not_ready_checks = 0;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_consecutive_failures {
            return Err(anyhow!(
                "upload cycle failed {} times in a row",
                self.consecutive_failures
            ));
        }
        Ok(())
    }
}

/// Whether detected labels make a frame an alert. Local detectors are
/// filtered by label name and score; remote labels by trigger words.
pub fn is_alert(mode: DetectionMode, labels: &[Label], settings: &UploadSettings) -> bool {
    match mode {
        DetectionMode::Local => !qualifying_labels(
            labels,
            &settings.alert_labels,
            settings.min_label_score,
        )
        .is_empty(),
        DetectionMode::Remote => evaluate_labels(labels, &settings.trigger_words),
    }
}

struct FrameJob {
    frame: AlarmFrame,
    local_path: String,
    key: String,
    decision: SampleDecision,
    labels: Vec<Label>,
}

/// UTC time of the frame including its sub-second offset.
pub fn frame_datetime(frame: &AlarmFrame, timezone: Tz) -> Result<DateTime<Utc>> {
    let millis: i64 = subsecond_millis(frame.delta).parse().unwrap_or(0);
    let naive = frame.frame_timestamp + chrono::Duration::milliseconds(millis);
    local_to_utc_lenient(&naive, timezone)
}

/// Object metadata for an uploaded frame. Alerts carry every detected label,
/// not only the ones that made the frame an alert, so face and object
/// queries see the whole frame.
pub fn frame_metadata(
    frame: &AlarmFrame,
    local_path: &str,
    alert: bool,
    labels: &[Label],
    timezone: Tz,
) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    metadata.insert(meta::MONITOR_NAME.to_string(), frame.monitor_name.clone());
    metadata.insert(meta::EVENT_NAME.to_string(), frame.event_name.clone());
    metadata.insert(meta::EVENT_ID.to_string(), frame.event_id.to_string());
    metadata.insert(meta::FRAME_ID.to_string(), frame.frame_id.to_string());
    metadata.insert(
        meta::FRAME_DATETIME.to_string(),
        format_zulu_millis(&frame_datetime(frame, timezone)?),
    );
    metadata.insert(meta::SCORE.to_string(), frame.score.to_string());
    metadata.insert(meta::LOCAL_EVENT_PATH.to_string(), local_path.to_string());
    metadata.insert(meta::ALERT.to_string(), alert.to_string());
    if alert {
        metadata.insert(
            meta::LABELS.to_string(),
            serde_json::to_string(labels).context("serialize labels")?,
        );
    }
    Ok(metadata)
}

async fn upload_frame(
    blob: Arc<dyn BlobStore>,
    settings: Arc<UploadSettings>,
    mode: DetectionMode,
    job: FrameJob,
) -> Result<FrameOutcome, CycleError> {
    let disposition = match job.decision {
        SampleDecision::Skip => Disposition::Skipped,
        SampleDecision::Detect => {
            let alert = is_alert(mode, &job.labels, &settings);
            if !alert && !settings.keep_false_positives {
                Disposition::FalsePositive { uploaded: false }
            } else {
                let body = tokio::fs::read(&job.local_path)
                    .await
                    .with_context(|| format!("Failed to read {}", job.local_path))
                    .map_err(CycleError::Transient)?;
                let metadata = frame_metadata(
                    &job.frame,
                    &job.local_path,
                    alert,
                    &job.labels,
                    settings.timezone,
                )
                .map_err(CycleError::Transient)?;
                blob.put(&settings.bucket, &job.key, body, metadata)
                    .await
                    .map_err(CycleError::Transient)?;
                if alert {
                    Disposition::Alert
                } else {
                    Disposition::FalsePositive { uploaded: true }
                }
            }
        }
    };
    Ok(FrameOutcome {
        event_id: job.frame.event_id,
        frame_id: job.frame.frame_id,
        local_path: job.local_path,
        key: job.key,
        labels: job.labels,
        disposition,
    })
}

pub struct Uploader {
    store: Arc<dyn FrameStore>,
    blob: Arc<dyn BlobStore>,
    dispatcher: Dispatcher,
    audit: Option<Arc<dyn AuditLog>>,
    downstream: Option<mpsc::Sender<UploadedObject>>,
    settings: Arc<UploadSettings>,
    stats: Arc<ServiceStats>,
    /// (event, frame) pairs already reported bad. They stay unmarked but are
    /// polled past so they cannot fill every poll.
    quarantine: Mutex<HashSet<(i64, i64)>>,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn FrameStore>,
        blob: Arc<dyn BlobStore>,
        dispatcher: Dispatcher,
        settings: UploadSettings,
        stats: Arc<ServiceStats>,
    ) -> Self {
        Self {
            store,
            blob,
            dispatcher,
            audit: None,
            downstream: None,
            settings: Arc::new(settings),
            stats,
            quarantine: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_downstream(mut self, tx: mpsc::Sender<UploadedObject>) -> Self {
        self.downstream = Some(tx);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            detection_mode: self.dispatcher.mode(),
            face_recognition: self.dispatcher.face_recognition_enabled(),
            audit_log: self.audit.is_some(),
            keep_false_positives: self.settings.keep_false_positives,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Run one poll/batch/detect/upload/mark cycle.
    #[instrument(skip(self), err)]
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let settings = &self.settings;
        let mut cycle = Cycle::start();

        cycle.enter(CycleState::Polling);
        let mut quarantine = self.quarantine.lock().await;
        let rows = self
            .store
            .find_unuploaded_frames(
                &settings.frame_type,
                settings.max_records + quarantine.len(),
                settings.since,
            )
            .await
            .map_err(CycleError::Transient)?;
        let rows: Vec<_> = rows
            .into_iter()
            .filter(|row| match (row.event_id, row.frame_id) {
                (Some(event_id), Some(frame_id)) => {
                    !quarantine.contains(&(event_id, frame_id))
                }
                _ => true,
            })
            .take(settings.max_records)
            .collect();
        cycle.report.found = rows.len();

        let mut frames = Vec::with_capacity(rows.len());
        for row in rows {
            match AlarmFrame::try_from(row) {
                Ok(frame) => frames.push(frame),
                Err(bad) => {
                    warn!("Skipping {}", bad);
                    cycle.report.bad += 1;
                    if let (Some(event_id), Some(frame_id)) = (bad.event_id, bad.frame_id) {
                        quarantine.insert((event_id, frame_id));
                    }
                }
            }
        }
        drop(quarantine);
        frames.sort_by(|a, b| {
            (a.monitor_name.as_str(), a.event_id, a.frame_id).cmp(&(
                b.monitor_name.as_str(),
                b.event_id,
                b.frame_id,
            ))
        });

        for batch in frames.chunks(settings.max_concurrent_upload.max(1)) {
            self.process_batch(&mut cycle, batch).await?;
        }

        let report = cycle.finish();
        if report.found > 0 {
            info!(
                "Upload cycle: found {}, processed {}, uploaded {}, skipped {}, bad {} in {:?} ({:.1} fps)",
                report.found,
                report.processed,
                report.uploaded,
                report.skipped,
                report.bad,
                report.elapsed,
                report.fps()
            );
        }
        Ok(report)
    }

    async fn process_batch(
        &self,
        cycle: &mut Cycle,
        batch: &[AlarmFrame],
    ) -> Result<(), CycleError> {
        let settings = &self.settings;

        cycle.enter(CycleState::Batching);
        let decisions = plan_sampling(
            batch.iter().map(|f| f.monitor_name.as_str()),
            settings.frame_skip,
        );
        let mut jobs: Vec<FrameJob> = batch
            .iter()
            .zip(decisions)
            .map(|(frame, decision)| FrameJob {
                local_path: build_local_path(
                    frame,
                    &settings.image_base_path,
                    settings.frame_id_width,
                ),
                key: upload_key(&build_storage_key(frame)),
                frame: frame.clone(),
                decision,
                labels: Vec::new(),
            })
            .collect();

        cycle.enter(CycleState::Detecting);
        let to_detect: Vec<String> = jobs
            .iter()
            .filter(|job| job.decision == SampleDecision::Detect)
            .map(|job| job.local_path.clone())
            .collect();
        let results = self
            .dispatcher
            .detect(&to_detect)
            .await
            .map_err(CycleError::Fatal)?;
        for (job, result) in jobs
            .iter_mut()
            .filter(|job| job.decision == SampleDecision::Detect)
            .zip(results)
        {
            job.labels = result.labels;
        }

        cycle.enter(CycleState::Uploading);
        let mode = self.dispatcher.mode();
        let mut tasks = JoinSet::new();
        for job in jobs {
            tasks.spawn(upload_frame(self.blob.clone(), settings.clone(), mode, job));
        }
        let mut settled = Vec::new();
        let mut failure: Option<CycleError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => settled.push(outcome),
                Ok(Err(e)) => {
                    error!("Frame pipeline failed: {}", e);
                    failure = worse(failure, e);
                }
                Err(e) => {
                    failure = worse(
                        failure,
                        CycleError::Fatal(anyhow!("frame pipeline task failed: {}", e)),
                    );
                }
            }
        }

        cycle.enter(CycleState::Marking);
        for outcome in &settled {
            self.store
                .mark_uploaded(outcome.frame_id, outcome.event_id)
                .await
                .map_err(|e| {
                    CycleError::Fatal(e.context(format!(
                        "Failed to mark frame {} of event {} uploaded",
                        outcome.frame_id, outcome.event_id
                    )))
                })?;
            cycle.report.processed += 1;
            if outcome.disposition == Disposition::Skipped {
                cycle.report.skipped += 1;
            }
            if outcome.uploaded() {
                cycle.report.uploaded += 1;
                self.hand_off(&outcome.key).await;
            }
        }

        self.audit_outcomes(&settled).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn hand_off(&self, key: &str) {
        let Some(tx) = &self.downstream else {
            return;
        };
        let object = UploadedObject {
            bucket: self.settings.bucket.clone(),
            key: key.to_string(),
        };
        if tx.send(object).await.is_err() {
            warn!("Downstream worker is gone, {} will not be archived", key);
        }
    }

    async fn audit_outcomes(&self, outcomes: &[FrameOutcome]) {
        let Some(audit) = &self.audit else {
            return;
        };
        for outcome in outcomes {
            let entry = AuditEntry {
                image: outcome.local_path.clone(),
                labels: outcome.labels.clone(),
                status: if outcome.disposition == Disposition::Skipped {
                    AuditStatus::Skipped
                } else {
                    AuditStatus::Processed
                },
                detection_mode: self.dispatcher.mode(),
            };
            if let Err(e) = audit.record(&entry).await {
                warn!("Failed to write audit entry for {}: {}", entry.image, e);
            }
        }
    }

    fn record_stats(&self, report: &CycleReport) {
        let stats = &self.stats;
        stats.cycles.fetch_add(1, Ordering::Relaxed);
        stats.frames_found.fetch_add(report.found as u64, Ordering::Relaxed);
        stats
            .frames_processed
            .fetch_add(report.processed as u64, Ordering::Relaxed);
        stats
            .frames_uploaded
            .fetch_add(report.uploaded as u64, Ordering::Relaxed);
        stats
            .frames_skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        stats.bad_frames.fetch_add(report.bad as u64, Ordering::Relaxed);
        stats
            .total_processing_time_ms
            .fetch_add(report.elapsed.as_millis() as u64, Ordering::Relaxed);
        if report.processed > 0 {
            stats
                .last_cycle_fps_milli
                .store((report.fps() * 1000.0) as u64, Ordering::Relaxed);
        }
    }

    /// Poll until shutdown is requested or a fatal error occurs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting upload loop with {:?}",
            self.capabilities()
        );
        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tracker = PollTracker::new(
            self.settings.max_not_ready_checks,
            self.settings.max_consecutive_failures,
        );
        let mut running: Option<JoinHandle<Result<CycleReport, CycleError>>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down upload loop - waiting for current cycle to complete");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(handle) = running.take() {
                        if !handle.is_finished() {
                            tracker.on_not_ready()?;
                            running = Some(handle);
                            continue;
                        }
                        match handle.await {
                            Ok(Ok(report)) => {
                                tracker.on_completed();
                                self.record_stats(&report);
                            }
                            Ok(Err(CycleError::Transient(e))) => {
                                self.stats.error_count.fetch_add(1, Ordering::Relaxed);
                                warn!("Upload cycle failed, retrying: {:#}", e);
                                tracker.on_transient_failure()?;
                            }
                            Ok(Err(CycleError::Fatal(e))) => {
                                self.stats.error_count.fetch_add(1, Ordering::Relaxed);
                                return Err(e.context("upload cycle failed"));
                            }
                            Err(e) => {
                                return Err(anyhow!("upload cycle task failed: {}", e));
                            }
                        }
                    }
                    let uploader = self.clone();
                    running = Some(tokio::spawn(async move { uploader.run_cycle().await }));
                }
            }
        }

        if let Some(handle) = running {
            match time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(Ok(report))) => self.record_stats(&report),
                Ok(Ok(Err(e))) => error!("Final upload cycle failed: {}", e),
                Ok(Err(e)) => error!("Final upload cycle task failed: {}", e),
                Err(_) => warn!("Timed out waiting for the final upload cycle"),
            }
        }
        info!("Upload loop terminated");
        Ok(())
    }
}

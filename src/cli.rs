use crate::config::PipelineConfig;
use crate::detection::DetectionMode;
use crate::upload::UploadSettings;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the zmwatch server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the recorder's frames database
    #[arg(long, env = "FRAMES_DB")]
    pub frames_db: PathBuf,

    /// Path to the zmwatch database (alarm index, detection audit)
    #[arg(long, env = "ZMWATCH_DB", default_value = "data/zmwatch.db")]
    pub zmwatch_db: PathBuf,

    /// Pipeline config file with cameras, faces and trigger words
    #[arg(long, env = "ZMWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, default_value_t = 3010)]
    pub port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Timezone the recorder writes timestamps in (e.g., "America/Los_Angeles")
    /// If not specified, the system timezone will be used
    #[arg(long, env = "TIMEZONE")]
    pub timezone: Option<String>,

    /// Run the alarm frame upload loop (enabled by default)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_upload: bool,

    /// Run the archive/index/notify worker for uploaded frames
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_downstream: bool,

    /// Path of the lock file held by the uploading instance
    #[arg(long, default_value = "/tmp/zmwatch_upload.lock")]
    pub lock_file: PathBuf,

    /// Recorder frame type to upload
    #[arg(long, default_value = "Alarm")]
    pub frame_type: String,

    /// Maximum frames fetched per poll
    #[arg(long, default_value_t = 400)]
    pub max_records: usize,

    /// Frames uploaded concurrently in one batch
    #[arg(long, default_value_t = 10)]
    pub max_concurrent_upload: usize,

    /// Frames skipped between detections, per monitor and batch
    #[arg(long, default_value_t = 0)]
    pub frame_skip: u32,

    /// Root of the recorder's event image tree
    #[arg(long, default_value = "/nvr/zoneminder/events")]
    pub image_base_path: String,

    /// Digits in the frame number of capture file names
    #[arg(long, default_value_t = 5)]
    pub frame_id_width: usize,

    /// Only frames newer than this many seconds are uploaded; 0 means all
    #[arg(long, default_value_t = 0)]
    pub lookback_secs: i64,

    /// Bucket receiving frames
    #[arg(long, env = "S3_BUCKET", default_value = "zm-alarm-frames")]
    pub bucket: String,

    /// AWS region for S3 and Rekognition
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Alternate S3 endpoint (e.g. minio)
    #[arg(long, env = "S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Where object detection runs
    #[arg(long, value_enum, default_value_t = DetectionMode::Local)]
    pub detection_mode: DetectionMode,

    /// URL of the local detection server
    #[arg(
        long,
        env = "DETECTOR_URL",
        default_value = "http://localhost:5000/detect"
    )]
    pub detector_url: String,

    /// Seconds to wait on the local detector before giving up
    #[arg(long, default_value_t = 60)]
    pub detector_heartbeat_secs: u64,

    /// Program reading a JSON label list on argv and printing it back with faces
    #[arg(long, env = "FACE_PROGRAM")]
    pub face_program: Option<PathBuf>,

    /// Minimum confidence for cloud label detection
    #[arg(long, default_value_t = 50.0)]
    pub min_confidence: f32,

    /// Record every detection in the audit table
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub audit_log: bool,

    /// Upload frames with no qualifying labels
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub keep_false_positives: bool,

    /// Milliseconds between polls
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Polls tolerated while a cycle is still running
    #[arg(long, default_value_t = 120)]
    pub max_not_ready_checks: u32,

    /// Back-to-back failed cycles tolerated before exiting
    #[arg(long, default_value_t = 10)]
    pub max_consecutive_failures: u32,

    /// Notification dedup cache file
    #[arg(long, default_value = "/tmp/alarm_cache")]
    pub cache_file: PathBuf,

    /// Webhook receiving alarm notifications; logged only when unset
    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    pub notify_webhook_url: Option<String>,

    /// Answer voice queries with recorder paths instead of signed URLs
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub use_local_path: bool,

    /// Alarm index rows fetched per page
    #[arg(long, default_value_t = 100)]
    pub page_size: usize,

    /// URL of the clip rendering service
    #[arg(long, env = "CLIP_URL")]
    pub clip_url: Option<String>,

    #[arg(long, env = "CLIP_USER")]
    pub clip_user: Option<String>,

    #[arg(long, env = "CLIP_PASSWORD")]
    pub clip_password: Option<String>,
}

impl Args {
    /// Upload loop settings for the given zone and alert vocabulary.
    pub fn upload_settings(
        &self,
        timezone: chrono_tz::Tz,
        config: &PipelineConfig,
    ) -> Result<UploadSettings> {
        let since = if self.lookback_secs > 0 {
            let lookback = ChronoDuration::try_seconds(self.lookback_secs)
                .context("lookback is out of range")?;
            (Utc::now() - lookback).with_timezone(&timezone).naive_local()
        } else {
            UploadSettings::default().since
        };
        Ok(UploadSettings {
            frame_type: self.frame_type.clone(),
            max_records: self.max_records,
            max_concurrent_upload: self.max_concurrent_upload.max(1),
            frame_skip: self.frame_skip,
            image_base_path: self.image_base_path.clone(),
            frame_id_width: self.frame_id_width,
            bucket: self.bucket.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_not_ready_checks: self.max_not_ready_checks,
            max_consecutive_failures: self.max_consecutive_failures,
            since,
            timezone,
            alert_labels: config.alert_labels.clone(),
            min_label_score: config.min_label_score,
            trigger_words: config.trigger_words.clone(),
            keep_false_positives: self.keep_false_positives,
        })
    }

    pub fn clip_credentials(&self) -> Option<(String, String)> {
        match (&self.clip_user, &self.clip_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["zmwatch_server", "--frames-db", "/tmp/zm.db"]);
        assert_eq!(args.max_records, 400);
        assert_eq!(args.max_concurrent_upload, 10);
        assert_eq!(args.detection_mode, DetectionMode::Local);
        assert!(args.enable_upload);
        assert!(args.keep_false_positives);
        assert!(args.clip_credentials().is_none());

        let settings = args
            .upload_settings(chrono_tz::America::Los_Angeles, &PipelineConfig::default())
            .unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.since, UploadSettings::default().since);
        assert!(settings.trigger_words.iter().any(|w| w == "Person"));
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "zmwatch_server",
            "--frames-db",
            "/tmp/zm.db",
            "--detection-mode",
            "remote",
            "--enable-upload",
            "false",
            "--frame-skip",
            "2",
            "--clip-user",
            "nvr",
            "--clip-password",
            "secret",
        ]);
        assert_eq!(args.detection_mode, DetectionMode::Remote);
        assert!(!args.enable_upload);
        assert_eq!(args.frame_skip, 2);
        assert_eq!(
            args.clip_credentials(),
            Some(("nvr".to_string(), "secret".to_string()))
        );
    }
}

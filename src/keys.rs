//! Storage keys and recorder file paths for alarm frames.
//!
//! Keys look like
//! `FrontPorch/2018-6-20/hour-9/New_Event-ID_123-Frame_45-9-20-4-340.jpg`.
//! Date and time parts are not zero padded, and the event name never
//! contains `-` so the file name can be split back into its parts.

use crate::frame_store::AlarmFrame;
use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;
use std::sync::OnceLock;

pub const UPLOAD_PREFIX: &str = "upload/";
pub const ARCHIVE_ALERTS_PREFIX: &str = "archive/alerts/";
pub const ARCHIVE_FALSE_POSITIVES_PREFIX: &str = "archive/falsepositives/";

pub const DEFAULT_FRAME_ID_WIDTH: usize = 5;

pub fn sanitize_event_name(name: &str) -> String {
    if name == "New Event" {
        "New_Event".to_string()
    } else {
        name.replace('-', "_")
    }
}

/// First three decimals of the fractional part of `delta`, e.g. `12.34` ->
/// `"340"`. Rounding up to a whole second yields `"000"`.
pub fn subsecond_millis(delta: f64) -> String {
    let formatted = format!("{:.3}", delta.abs().fract());
    formatted.get(2..).unwrap_or("000").to_string()
}

pub fn build_storage_key(frame: &AlarmFrame) -> String {
    let ts = frame.frame_timestamp;
    format!(
        "{}/{}-{}-{}/hour-{}/{}-ID_{}-Frame_{}-{}-{}-{}-{}.jpg",
        frame.monitor_name,
        ts.year(),
        ts.month(),
        ts.day(),
        ts.hour(),
        sanitize_event_name(&frame.event_name),
        frame.event_id,
        frame.frame_id,
        ts.hour(),
        ts.minute(),
        ts.second(),
        subsecond_millis(frame.delta)
    )
}

pub fn upload_key(storage_key: &str) -> String {
    format!("{}{}", UPLOAD_PREFIX, storage_key)
}

/// Rewrite an `upload/` key into its archive location.
pub fn archive_key(key: &str, alert: bool) -> String {
    let prefix = if alert {
        ARCHIVE_ALERTS_PREFIX
    } else {
        ARCHIVE_FALSE_POSITIVES_PREFIX
    };
    let rest = key.strip_prefix(UPLOAD_PREFIX).unwrap_or(key);
    format!("{}{}", prefix, rest)
}

fn numbered_monitor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Monitor-(\d+)$").expect("static monitor regex")
    })
}

/// Recorder directory name for a monitor: `Monitor-3` is stored as `3`.
pub fn monitor_directory(monitor_name: &str) -> String {
    match numbered_monitor_regex().captures(monitor_name) {
        Some(caps) => caps[1].to_string(),
        None => monitor_name.to_string(),
    }
}

/// Path of the captured JPEG on the recorder's disk. The directory is named
/// after the *event* start time, not the frame time.
pub fn build_local_path(
    frame: &AlarmFrame,
    base: &str,
    frame_id_width: usize,
) -> String {
    let start = frame.event_start;
    format!(
        "{}/{}/{}/{:02}/{:02}/{:02}/{:02}/{:02}/{:0width$}-capture.jpg",
        base.trim_end_matches('/'),
        monitor_directory(&frame.monitor_name),
        start.format("%y"),
        start.month(),
        start.day(),
        start.hour(),
        start.minute(),
        start.second(),
        frame.frame_id,
        width = frame_id_width
    )
}

/// The parts encoded in a storage key.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedKey {
    pub camera: String,
    pub event_name: String,
    pub event_id: i64,
    pub frame_id: i64,
    /// Recorder-local frame time, millisecond resolution.
    pub local_datetime: NaiveDateTime,
}

/// Parse a storage key, with or without an `upload/` or `archive/...`
/// prefix.
pub fn parse_storage_key(key: &str) -> Result<ParsedKey> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() < 4 {
        return Err(anyhow!("storage key has too few segments: {}", key));
    }
    let n = segments.len();
    let camera = segments[n - 4];
    let date = segments[n - 3];
    let file = segments[n - 1];

    let number = |part: &str, what: &str| -> Result<i64> {
        part.parse::<i64>()
            .with_context(|| format!("bad {} '{}' in key {}", what, part, key))
    };

    let date_parts: Vec<&str> = date.split('-').collect();
    if date_parts.len() != 3 {
        return Err(anyhow!("bad date segment '{}' in key {}", date, key));
    }
    let year = number(date_parts[0], "year")?;
    let month = number(date_parts[1], "month")?;
    let day = number(date_parts[2], "day")?;

    let stem = file
        .strip_suffix(".jpg")
        .ok_or_else(|| anyhow!("key is not a jpg: {}", key))?;
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() != 7 {
        return Err(anyhow!("bad file name '{}' in key {}", file, key));
    }
    let event_id = parts[1]
        .strip_prefix("ID_")
        .ok_or_else(|| anyhow!("missing event id in key {}", key))
        .and_then(|id| number(id, "event id"))?;
    let frame_id = parts[2]
        .strip_prefix("Frame_")
        .ok_or_else(|| anyhow!("missing frame id in key {}", key))
        .and_then(|id| number(id, "frame id"))?;
    let hour = number(parts[3], "hour")?;
    let minute = number(parts[4], "minute")?;
    let second = number(parts[5], "second")?;
    let millis = number(parts[6], "milliseconds")?;

    let local_datetime =
        NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            .and_then(|d| {
                d.and_hms_milli_opt(
                    hour as u32,
                    minute as u32,
                    second as u32,
                    millis as u32,
                )
            })
            .ok_or_else(|| anyhow!("key encodes an invalid datetime: {}", key))?;

    Ok(ParsedKey {
        camera: camera.to_string(),
        event_name: parts[0].to_string(),
        event_id,
        frame_id,
        local_datetime,
    })
}

use anyhow::{anyhow, Result};
use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;

/// Get the local timezone as a chrono_tz::Tz
/// If configured_timezone is provided, it will be used
/// Otherwise, falls back to the system timezone from iana-time-zone
/// If both fail, defaults to America/Los_Angeles
pub fn get_local_timezone(configured_timezone: Option<&str>) -> Tz {
    if let Some(tz_str) = configured_timezone {
        if let Ok(tz) = Tz::from_str(tz_str) {
            return tz;
        }
    }

    match iana_time_zone::get_timezone() {
        Ok(tz_str) => {
            Tz::from_str(&tz_str).unwrap_or(chrono_tz::America::Los_Angeles)
        }
        Err(_) => chrono_tz::America::Los_Angeles,
    }
}

/// Formats accepted for recorder timestamps stored as text.
const RECORDER_FORMATS: [&str; 3] =
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

pub fn parse_recorder_timestamp(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    RECORDER_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| anyhow!("Failed to parse recorder timestamp: {}", value))
}

/// Convert a recorder-local wall clock time to UTC.
///
/// Ambiguous times (the repeated hour when DST ends) resolve to the earlier
/// instant. Times inside the DST gap do not exist and are an error.
pub fn local_to_utc(naive: &NaiveDateTime, timezone: Tz) -> Result<DateTime<Utc>> {
    match timezone.from_local_datetime(naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(anyhow!(
            "local time {} does not exist in timezone {}",
            naive,
            timezone
        )),
    }
}

/// Like [`local_to_utc`], but a wall clock time inside the spring-forward gap
/// is read as if the clock had already jumped.
pub fn local_to_utc_lenient(naive: &NaiveDateTime, timezone: Tz) -> Result<DateTime<Utc>> {
    local_to_utc(naive, timezone)
        .or_else(|_| local_to_utc(&(*naive + chrono::Duration::hours(1)), timezone))
}

/// ISO-8601 UTC with millisecond precision, e.g. `2018-06-20T09:20:04.340Z`.
pub fn format_zulu_millis(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_zulu(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("Failed to parse datetime {}: {}", value, e))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CalendarDuration {
    pub years: i64,
    pub months: i64,
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl CalendarDuration {
    /// Months count as 30.1 days, years as 365 days. `None` on overflow.
    pub fn total_seconds(&self) -> Option<i64> {
        [
            (self.years, 31_536_000),
            (self.months, 2_600_640),
            (self.weeks, 604_800),
            (self.days, 86_400),
            (self.hours, 3_600),
            (self.minutes, 60),
            (self.seconds, 1),
        ]
        .iter()
        .try_fold(0i64, |total, (count, unit)| {
            count.checked_mul(*unit).and_then(|s| total.checked_add(s))
        })
    }
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
        )
        .expect("static duration regex")
    })
}

/// Parse an ISO-8601 calendar duration such as `P1W`, `P3D` or `PT2H30M`.
pub fn parse_iso8601_duration(value: &str) -> Result<CalendarDuration> {
    let trimmed = value.trim().to_ascii_uppercase();
    if trimmed == "P" || trimmed.ends_with('T') {
        return Err(anyhow!("Empty duration: {}", value));
    }
    let caps = duration_regex()
        .captures(&trimmed)
        .ok_or_else(|| anyhow!("Failed to parse duration: {}", value))?;

    let part = |idx: usize| -> Result<i64> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse::<i64>()
                .map_err(|e| anyhow!("Bad duration component {}: {}", m.as_str(), e)),
            None => Ok(0),
        }
    };

    Ok(CalendarDuration {
        years: part(1)?,
        months: part(2)?,
        weeks: part(3)?,
        days: part(4)?,
        hours: part(5)?,
        minutes: part(6)?,
        seconds: part(7)?,
    })
}

/// `now` minus the given ISO-8601 duration.
pub fn since_from_duration(now: DateTime<Utc>, value: &str) -> Result<DateTime<Utc>> {
    let duration = parse_iso8601_duration(value)?;
    duration
        .total_seconds()
        .and_then(chrono::TimeDelta::try_seconds)
        .and_then(|delta| now.checked_sub_signed(delta))
        .ok_or_else(|| anyhow!("Duration out of range: {}", value))
}

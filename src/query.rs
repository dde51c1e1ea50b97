//! Finds alarms in the alarm index for the voice front end.

use crate::alarm_index::{AlarmIndex, AlarmRecord, PageRequest, SortOrder};
use crate::detection::Label;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmQuery {
    pub camera: String,
    /// Face name to require; wins over `object` when both are set.
    pub face: Option<String>,
    pub object: Option<String>,
    pub count: usize,
    pub since: DateTime<Utc>,
    pub order: SortOrder,
    /// Keep only the first matching frame of each run of same-event rows.
    pub first_frame_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmQueryResult {
    pub camera_name: String,
    pub event_id: i64,
    pub frame_id: i64,
    pub event_datetime: DateTime<Utc>,
    pub storage_key: String,
    pub local_path: Option<String>,
    pub labels: Vec<Label>,
}

impl From<AlarmRecord> for AlarmQueryResult {
    fn from(record: AlarmRecord) -> Self {
        Self {
            camera_name: record.camera_name,
            event_id: record.event_id,
            frame_id: record.frame_id,
            event_datetime: record.event_datetime,
            storage_key: record.storage_key,
            local_path: record.local_path,
            labels: record.labels,
        }
    }
}

fn matches_filter(labels: &[Label], query: &AlarmQuery) -> bool {
    if let Some(face) = &query.face {
        return labels.iter().any(|l| l.face.as_deref() == Some(face.as_str()));
    }
    if let Some(object) = &query.object {
        return labels.iter().any(|l| l.name.eq_ignore_ascii_case(object));
    }
    true
}

/// Page through one camera's alert rows until `count` matches are found or
/// the index runs out.
#[instrument(skip(index), err)]
pub async fn find_alarms(
    index: &dyn AlarmIndex,
    query: &AlarmQuery,
    page_size: usize,
) -> Result<Vec<AlarmQueryResult>> {
    let mut found = Vec::new();
    if query.count == 0 {
        return Ok(found);
    }

    let mut request = PageRequest {
        camera: query.camera.clone(),
        since: query.since,
        order: query.order,
        alert_only: true,
        limit: page_size.max(1),
        start_after: None,
    };
    let mut last_event_id: Option<i64> = None;
    let mut pages = 0;

    loop {
        let page = index.query_page(&request).await?;
        pages += 1;
        for record in page.items {
            if query.first_frame_only && last_event_id == Some(record.event_id) {
                continue;
            }
            if !matches_filter(&record.labels, query) {
                continue;
            }
            last_event_id = Some(record.event_id);
            found.push(AlarmQueryResult::from(record));
            if found.len() >= query.count {
                debug!("Found {} alarms in {} pages", found.len(), pages);
                return Ok(found);
            }
        }
        match page.next {
            Some(token) => request.start_after = Some(token),
            None => break,
        }
    }

    debug!("Found {} alarms in {} pages", found.len(), pages);
    Ok(found)
}

/// Run one query per camera concurrently, then merge the results sorted by
/// event time in the requested order and keep the first `count`.
#[instrument(skip(index, template), err)]
pub async fn find_alarms_across(
    index: Arc<dyn AlarmIndex>,
    cameras: &[String],
    template: &AlarmQuery,
    page_size: usize,
) -> Result<Vec<AlarmQueryResult>> {
    let mut merged = find_alarms_per_camera(index, cameras, template, page_size).await?;
    merged.truncate(template.count);
    Ok(merged)
}

/// Up to `count` alarms from each camera, merged and sorted by event time.
#[instrument(skip(index, template), err)]
pub async fn find_alarms_per_camera(
    index: Arc<dyn AlarmIndex>,
    cameras: &[String],
    template: &AlarmQuery,
    page_size: usize,
) -> Result<Vec<AlarmQueryResult>> {
    let mut tasks = JoinSet::new();
    for camera in cameras {
        let index = index.clone();
        let query = AlarmQuery {
            camera: camera.clone(),
            ..template.clone()
        };
        tasks.spawn(async move { find_alarms(index.as_ref(), &query, page_size).await });
    }

    let mut merged = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let results =
            joined.map_err(|e| anyhow!("alarm query task failed: {}", e))??;
        merged.extend(results);
    }

    merged.sort_by(|a, b| match template.order {
        SortOrder::Ascending => a.event_datetime.cmp(&b.event_datetime),
        SortOrder::Descending => b.event_datetime.cmp(&a.event_datetime),
    });
    Ok(merged)
}

/// The most recent alarm over all `cameras`.
pub async fn latest_alarm_across(
    index: Arc<dyn AlarmIndex>,
    cameras: &[String],
    template: &AlarmQuery,
    page_size: usize,
) -> Result<Option<AlarmQueryResult>> {
    let query = AlarmQuery {
        count: 1,
        order: SortOrder::Descending,
        ..template.clone()
    };
    let merged = find_alarms_across(index, cameras, &query, page_size).await?;
    Ok(merged.into_iter().next())
}

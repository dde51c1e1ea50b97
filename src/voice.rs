//! Voice front end queries: turns spoken camera, who-or-what and time-window
//! tokens into alarm queries and answers with something a speaker can say.

use crate::alarm_index::SortOrder;
use crate::alerts::{determine_person_or_thing, map_camera_alias};
use crate::clip::{ClipRange, CLIP_SEARCH_COUNT};
use crate::detection::Label;
use crate::query::{
    find_alarms, find_alarms_across, find_alarms_per_camera, latest_alarm_across,
    AlarmQuery, AlarmQueryResult,
};
use crate::session::{SessionError, DEFAULT_SESSION_TTL};
use crate::time_util::since_from_duration;
use crate::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

/// Window searched by the "latest alarm" question.
pub const LATEST_WINDOW: &str = "P1W";
/// Window searched when a list request names no duration.
pub const DEFAULT_LIST_WINDOW: &str = "P3D";
/// Alarms listed for a single camera when no count is given.
pub const DEFAULT_CAMERA_LIST_COUNT: usize = 25;
/// Alarms taken from each camera when listing all cameras.
pub const DEFAULT_PER_CAMERA_COUNT: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("No alarms were found")]
    NotFound,
    #[error("Unknown camera '{0}'")]
    BadCamera(String),
    #[error("Bad duration '{0}'")]
    BadDuration(String),
    #[error("Selection {selection} is not between 1 and {available}")]
    BadSelection { selection: usize, available: usize },
    #[error("Clip service is not configured")]
    ClipUnavailable,
    #[error("Clip request failed: {0:#}")]
    ClipFailed(anyhow::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::NotFound => StatusCode::NOT_FOUND,
            QueryError::BadCamera(_)
            | QueryError::BadDuration(_)
            | QueryError::BadSelection { .. } => StatusCode::BAD_REQUEST,
            QueryError::ClipUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::ClipFailed(_) => StatusCode::BAD_GATEWAY,
            QueryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// What the voice assistant should say back.
    pub fn speech(&self) -> &'static str {
        match self {
            QueryError::NotFound => "No alarms were found.",
            QueryError::BadCamera(_) => "Sorry, I cannot find that camera name.",
            QueryError::BadDuration(_) => "Sorry, I did not understand that time.",
            QueryError::BadSelection { .. } => "Sorry, that's not a valid selection.",
            QueryError::ClipUnavailable
            | QueryError::ClipFailed(_)
            | QueryError::Store(_) => "Sorry, I cannot complete the request.",
        }
    }
}

impl From<SessionError> for QueryError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => QueryError::NotFound,
            SessionError::SelectionOutOfRange {
                selection,
                available,
            } => QueryError::BadSelection {
                selection,
                available,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub speech: String,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        match &self {
            QueryError::Store(e) => error!("Alarm query failed: {:?}", e),
            QueryError::ClipFailed(e) => error!("Clip request failed: {:?}", e),
            _ => {}
        }
        let body = ErrorBody {
            error: self.to_string(),
            speech: self.speech().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlarmsParams {
    pub camera: Option<String>,
    pub who: Option<String>,
    pub since: Option<String>,
    pub count: Option<usize>,
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub all_frames: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmView {
    pub camera: String,
    pub event_id: i64,
    pub frame_id: i64,
    pub event_datetime: DateTime<Utc>,
    pub url: String,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmListResponse {
    pub speech: String,
    pub alarms: Vec<AlarmView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmResponse {
    pub speech: String,
    pub alarm: AlarmView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipView {
    pub speech: String,
    #[serde(flatten)]
    pub range: ClipRange,
    /// What the clip service reported, usually where the video landed.
    pub message: String,
}

/// Canonical camera names to search: every configured camera when no token
/// is given.
pub fn resolve_cameras(
    state: &AppState,
    camera: Option<&str>,
) -> Result<Vec<String>, QueryError> {
    match camera_token(camera) {
        None => Ok(state.config.camera_names()),
        Some(token) => {
            let name = map_camera_alias(token, &state.config.cameras);
            if name.is_empty() {
                return Err(QueryError::BadCamera(token.to_string()));
            }
            Ok(vec![name])
        }
    }
}

fn camera_token(camera: Option<&str>) -> Option<&str> {
    camera.map(str::trim).filter(|c| !c.is_empty())
}

pub fn resolve_since(
    now: DateTime<Utc>,
    since: Option<&str>,
    default: &str,
) -> Result<DateTime<Utc>, QueryError> {
    let value = since.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(default);
    since_from_duration(now, value)
        .map_err(|_| QueryError::BadDuration(value.to_string()))
}

fn query_template(
    state: &AppState,
    who: Option<&str>,
    since: DateTime<Utc>,
    count: usize,
    order: SortOrder,
    first_frame_only: bool,
) -> AlarmQuery {
    let filter = who
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .map(|w| determine_person_or_thing(w, &state.config.faces))
        .unwrap_or_default();
    AlarmQuery {
        camera: String::new(),
        face: filter.face,
        object: filter.object,
        count,
        since,
        order,
        first_frame_only,
    }
}

/// URL the caller can fetch the frame from.
async fn view(
    state: &AppState,
    result: AlarmQueryResult,
) -> Result<AlarmView, QueryError> {
    let url = match (&result.local_path, state.use_local_path) {
        (Some(path), true) => path.clone(),
        _ => {
            state
                .blob_store
                .signed_url(&state.bucket, &result.storage_key, state.signed_url_ttl)
                .await?
        }
    };
    Ok(AlarmView {
        camera: result.camera_name,
        event_id: result.event_id,
        frame_id: result.frame_id,
        event_datetime: result.event_datetime,
        url,
        labels: result.labels,
    })
}

fn caused_by(who: Option<&str>) -> String {
    match who.map(str::trim).filter(|w| !w.is_empty()) {
        Some(w) => format!(" caused by {}", w.to_lowercase()),
        None => String::new(),
    }
}

async fn run_list_query(
    state: &AppState,
    params: &AlarmsParams,
) -> Result<(String, Vec<AlarmQueryResult>), QueryError> {
    let cameras = resolve_cameras(state, params.camera.as_deref())?;
    let since = resolve_since(Utc::now(), params.since.as_deref(), DEFAULT_LIST_WINDOW)?;

    let single_camera = match (camera_token(params.camera.as_deref()), cameras.as_slice()) {
        (Some(_), [camera]) => Some(camera.clone()),
        _ => None,
    };
    let (default_count, default_order, mut speech) = match &single_camera {
        Some(camera) => (
            DEFAULT_CAMERA_LIST_COUNT,
            SortOrder::Ascending,
            format!("Showing oldest alarms first from {}", camera),
        ),
        None => (
            DEFAULT_PER_CAMERA_COUNT,
            SortOrder::Descending,
            "Showing latest alarms from all cameras".to_string(),
        ),
    };
    speech.push_str(&caused_by(params.who.as_deref()));

    let template = query_template(
        state,
        params.who.as_deref(),
        since,
        params.count.unwrap_or(default_count),
        params.order.unwrap_or(default_order),
        !params.all_frames,
    );
    info!("Alarm list query over {:?}: {:?}", cameras, template);

    let index = state.alarm_index.clone();
    let results = if single_camera.is_some() {
        find_alarms_across(index, &cameras, &template, state.page_size).await?
    } else {
        // Each camera contributes its own `count`, so a busy camera does not
        // crowd out the rest.
        find_alarms_per_camera(index, &cameras, &template, state.page_size).await?
    };
    if results.is_empty() {
        return Err(QueryError::NotFound);
    }
    Ok((speech, results))
}

#[instrument(skip(state), err)]
pub async fn list_alarms(
    state: &AppState,
    params: &AlarmsParams,
) -> Result<AlarmListResponse, QueryError> {
    let (speech, results) = run_list_query(state, params).await?;
    let mut alarms = Vec::with_capacity(results.len());
    for result in results {
        alarms.push(view(state, result).await?);
    }
    Ok(AlarmListResponse { speech, alarms })
}

/// The most recent alarm in the last week.
#[instrument(skip(state), err)]
pub async fn latest_alarm(
    state: &AppState,
    camera: Option<&str>,
    who: Option<&str>,
) -> Result<AlarmResponse, QueryError> {
    let cameras = resolve_cameras(state, camera)?;
    let since = resolve_since(Utc::now(), None, LATEST_WINDOW)?;
    let template = query_template(state, who, since, 1, SortOrder::Descending, true);

    let latest = latest_alarm_across(
        state.alarm_index.clone(),
        &cameras,
        &template,
        state.page_size,
    )
    .await?
    .ok_or(QueryError::NotFound)?;

    let alarm = view(state, latest).await?;
    let speech = format!(
        "Showing the last alarm from {}{}",
        alarm.camera,
        caused_by(who)
    );
    Ok(AlarmResponse { speech, alarm })
}

/// Run a list query and remember the results for follow-up selection.
#[instrument(skip(state), err)]
pub async fn store_session_alarms(
    state: &AppState,
    session: &str,
    params: &AlarmsParams,
) -> Result<AlarmListResponse, QueryError> {
    let (speech, results) = run_list_query(state, params).await?;
    let mut alarms = Vec::with_capacity(results.len());
    for result in results.iter().cloned() {
        alarms.push(view(state, result).await?);
    }
    state
        .sessions
        .insert(session.to_string(), results, DEFAULT_SESSION_TTL)
        .await;
    Ok(AlarmListResponse { speech, alarms })
}

/// Alarm `selection` (1-indexed) from the session's last list.
#[instrument(skip(state), err)]
pub async fn select_session_alarm(
    state: &AppState,
    session: &str,
    selection: usize,
) -> Result<AlarmResponse, QueryError> {
    let result = state.sessions.select(session, selection).await?;
    let alarm = view(state, result).await?;
    let speech = format!("Showing alarm {} from {}", selection, alarm.camera);
    Ok(AlarmResponse { speech, alarm })
}

/// Frame range covering the camera's latest event of the past week.
#[instrument(skip(state), err)]
pub async fn latest_clip_range(
    state: &AppState,
    camera: Option<&str>,
) -> Result<ClipRange, QueryError> {
    let token = camera_token(camera).ok_or_else(|| QueryError::BadCamera(String::new()))?;
    let cameras = resolve_cameras(state, Some(token))?;
    let since = resolve_since(Utc::now(), None, LATEST_WINDOW)?;
    let mut query = query_template(
        state,
        None,
        since,
        CLIP_SEARCH_COUNT,
        SortOrder::Descending,
        false,
    );
    // A resolved token names exactly one camera.
    query.camera = cameras.into_iter().next().unwrap_or_default();

    let alarms = find_alarms(state.alarm_index.as_ref(), &query, state.page_size).await?;
    ClipRange::latest_event(&alarms).ok_or(QueryError::NotFound)
}

/// Frame range around alarm `selection` of the session's last list.
#[instrument(skip(state), err)]
pub async fn session_clip_range(
    state: &AppState,
    session: &str,
    selection: usize,
) -> Result<ClipRange, QueryError> {
    let alarm = state.sessions.select(session, selection).await?;
    Ok(ClipRange::around(&alarm))
}

/// Ask the clip service to render `range`.
#[instrument(skip(state), err)]
pub async fn request_clip(
    state: &AppState,
    range: ClipRange,
) -> Result<ClipView, QueryError> {
    let client = state
        .clip_client
        .as_ref()
        .ok_or(QueryError::ClipUnavailable)?;
    let clip = client
        .request_clip(range)
        .await
        .map_err(QueryError::ClipFailed)?;
    if !clip.success {
        return Err(QueryError::ClipFailed(anyhow::anyhow!(
            "clip service reported failure: {}",
            clip.message
        )));
    }
    Ok(ClipView {
        speech: "Showing clip of selected alarm.".to_string(),
        range,
        message: clip.message,
    })
}

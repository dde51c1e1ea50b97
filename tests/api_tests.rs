use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Json, Router,
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use zmwatch::alarm_index::AlarmRecord;
use zmwatch::clip::ClipClient;
use zmwatch::detection::Label;
use zmwatch::test_utils::init_test_logging;
use zmwatch::AppState;

/// Create a test app over a fresh state
fn app() -> (Arc<AppState>, Router) {
    app_with(AppState::new_for_testing())
}

fn app_with(state: AppState) -> (Arc<AppState>, Router) {
    init_test_logging();
    let app_state = Arc::new(state);
    let routes = zmwatch::app::routes(app_state.clone());
    (app_state, routes)
}

async fn seed(
    state: &AppState,
    camera: &str,
    minutes_ago: i64,
    event_id: i64,
    frame_id: i64,
    label: Label,
) {
    let record = AlarmRecord {
        camera_name: camera.into(),
        event_datetime: Utc::now() - Duration::minutes(minutes_ago),
        event_name: "New_Event".into(),
        event_id,
        frame_id,
        storage_key: format!(
            "archive/alerts/{camera}/New_Event-ID_{event_id}-Frame_{frame_id}.jpg"
        ),
        stored_at: None,
        local_path: Some(format!("/nvr/{camera}/{event_id}/{frame_id}.jpg")),
        labels: vec![label],
        alert: true,
    };
    state.alarm_index.put(&record).await.unwrap();
}

fn face(name: &str, face: &str) -> Label {
    let mut label = Label::new(name, 90.0);
    label.face = Some(face.to_string());
    label
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_, router) = app();

    let response = router.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_not_found() {
    let (_, router) = app();

    let response = router.oneshot(get_request("/does-not-exist")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_with_real_server() {
    use tokio::net::TcpListener;

    // Bind to a random port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (_app_state, router) = app();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let response = reqwest::Client::new()
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_status_reports_stats() {
    let (state, router) = app();
    state
        .stats
        .frames_uploaded
        .fetch_add(4, std::sync::atomic::Ordering::Relaxed);

    let (status, body) = send(&router, get_request("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["frames_uploaded"], 4);
    assert_eq!(body["bucket"], "test-bucket");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn test_stranger_query_finds_unknown_face() {
    let (state, router) = app();
    for (minutes_ago, event_id) in [(50, 1), (40, 2), (20, 4), (10, 5)] {
        seed(&state, "FrontPorch", minutes_ago, event_id, 1, Label::new("person", 90.0))
            .await;
    }
    seed(&state, "FrontPorch", 30, 3, 1, face("person", "Unknown")).await;

    let (status, body) = send(
        &router,
        get_request("/api/alarms?camera=front&who=stranger&count=1&order=desc"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let alarms = body["alarms"].as_array().unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["event_id"], 3);
    assert_eq!(alarms[0]["camera"], "FrontPorch");
    assert!(alarms[0]["url"].as_str().unwrap().starts_with("memory://test-bucket/"));
    assert!(body["speech"].as_str().unwrap().contains("caused by stranger"));
}

#[tokio::test]
async fn test_latest_alarm_across_cameras() {
    let (state, router) = app();
    seed(&state, "FrontPorch", 10, 1, 1, Label::new("person", 90.0)).await;
    seed(&state, "Garage", 5, 2, 1, Label::new("person", 90.0)).await;

    let (status, body) = send(&router, get_request("/api/alarms/latest")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alarm"]["camera"], "Garage");
    assert_eq!(body["alarm"]["event_id"], 2);
}

#[tokio::test]
async fn test_list_collapses_events_unless_all_frames() {
    let (state, router) = app();
    seed(&state, "Garage", 30, 7, 1, Label::new("person", 90.0)).await;
    seed(&state, "Garage", 29, 7, 2, Label::new("person", 90.0)).await;
    seed(&state, "Garage", 28, 8, 1, Label::new("person", 90.0)).await;

    let (_, body) = send(&router, get_request("/api/alarms?camera=garage")).await;
    let frames: Vec<(i64, i64)> = body["alarms"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| (a["event_id"].as_i64().unwrap(), a["frame_id"].as_i64().unwrap()))
        .collect();
    // Single camera lists oldest first.
    assert_eq!(frames, vec![(7, 1), (8, 1)]);

    let (_, body) = send(
        &router,
        get_request("/api/alarms?camera=garage&all_frames=true"),
    )
    .await;
    assert_eq!(body["alarms"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_local_paths_instead_of_signed_urls() {
    let mut state = AppState::new_for_testing();
    state.use_local_path = true;
    let (state, router) = app_with(state);
    seed(&state, "Backyard", 5, 9, 3, Label::new("dog", 90.0)).await;

    let (status, body) = send(&router, get_request("/api/alarms/latest?who=rex")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alarm"]["url"], "/nvr/Backyard/9/3.jpg");
}

#[tokio::test]
async fn test_user_errors_carry_speech() {
    let (_, router) = app();

    let (status, body) =
        send(&router, get_request("/api/alarms?camera=attic")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["speech"], "Sorry, I cannot find that camera name.");

    let (status, body) =
        send(&router, get_request("/api/alarms?since=yesterday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("yesterday"));

    let (status, body) = send(&router, get_request("/api/alarms/latest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["speech"], "No alarms were found.");
}

#[tokio::test]
async fn test_session_list_then_select() {
    let (state, router) = app();
    seed(&state, "FrontPorch", 30, 1, 1, face("person", "alice")).await;
    seed(&state, "FrontPorch", 20, 2, 1, Label::new("car", 90.0)).await;
    seed(&state, "FrontPorch", 10, 3, 1, face("person", "alice")).await;

    let (status, body) = send(
        &router,
        post_json("/api/sessions/abc/alarms", json!({"camera": "front porch", "who": "mum"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alarms"].as_array().unwrap().len(), 2);

    let (status, body) =
        send(&router, get_request("/api/sessions/abc/alarms/2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alarm"]["event_id"], 3);

    let (status, body) =
        send(&router, get_request("/api/sessions/abc/alarms/5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["speech"], "Sorry, that's not a valid selection.");

    // Other sessions have seen nothing.
    let (status, _) = send(&router, get_request("/api/sessions/xyz/alarms/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(state.sessions.len().await, 1);
}

/// Clip service that echoes the query it was called with.
async fn echo_clip_service() -> ClipClient {
    use tokio::net::TcpListener;

    let clip_service = Router::new().route(
        "/gen-vid",
        get(|axum::extract::RawQuery(query): axum::extract::RawQuery| async move {
            Json(json!({"success": true, "message": query.unwrap_or_default()}))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, clip_service).await.unwrap();
    });
    ClipClient::new(&format!("http://{}/gen-vid", addr), None).unwrap()
}

#[tokio::test]
async fn test_clip_of_latest_event() {
    let mut state = AppState::new_for_testing();
    state.clip_client = Some(echo_clip_service().await);
    let (state, router) = app_with(state);
    seed(&state, "Garage", 40, 41, 300, Label::new("car", 90.0)).await;
    seed(&state, "Garage", 20, 42, 30, Label::new("person", 90.0)).await;
    seed(&state, "Garage", 19, 42, 45, Label::new("person", 90.0)).await;
    seed(&state, "Garage", 18, 42, 60, Label::new("person", 90.0)).await;

    let (status, body) =
        send(&router, post_json("/api/clip", json!({"camera": "garage"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["event_id"], 42);
    assert_eq!(body["start_frame"], 10);
    assert_eq!(body["end_frame"], 80);
    assert_eq!(body["message"], "event=42&start_frame=10&end_frame=80");
    assert_eq!(body["speech"], "Showing clip of selected alarm.");

    let (status, body) =
        send(&router, post_json("/api/clip", json!({"camera": "attic"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["speech"], "Sorry, I cannot find that camera name.");

    let (status, _) =
        send(&router, post_json("/api/clip", json!({"camera": "backyard"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_clip_of_session_selection() {
    let mut state = AppState::new_for_testing();
    state.clip_client = Some(echo_clip_service().await);
    let (state, router) = app_with(state);
    seed(&state, "FrontPorch", 30, 1, 250, Label::new("person", 90.0)).await;
    seed(&state, "FrontPorch", 20, 2, 40, Label::new("person", 90.0)).await;

    let (status, _) = send(
        &router,
        post_json("/api/sessions/abc/alarms", json!({"camera": "front"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        post_json("/api/sessions/abc/alarms/1/clip", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "event=1&start_frame=150&end_frame=350");

    let (_, body) = send(
        &router,
        post_json("/api/sessions/abc/alarms/2/clip", json!({})),
    )
    .await;
    assert_eq!(body["message"], "event=2&start_frame=0&end_frame=140");
}

#[tokio::test]
async fn test_clip_without_service_is_unavailable() {
    let (state, router) = app();
    seed(&state, "Garage", 5, 42, 30, Label::new("person", 90.0)).await;

    let (status, body) =
        send(&router, post_json("/api/clip", json!({"camera": "garage"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["speech"], "Sorry, I cannot complete the request.");
}

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zmwatch::audit::{AuditStatus, RecordingAuditLog};
use zmwatch::blob::memory::MemoryBlobStore;
use zmwatch::blob::meta;
use zmwatch::alarm_index::SqliteAlarmIndex;
use zmwatch::config::{PipelineConfig, DEFAULT_TRIGGER_WORDS};
use zmwatch::detection::fake::{FakeDetectionBackend, FakeStoredImageDetector};
use zmwatch::detection::{DetectionMode, Dispatcher, Label, StoredImageDetector};
use zmwatch::downstream::{process_uploaded, ChainContext};
use zmwatch::notifier::FakeNotifier;
use zmwatch::frame_store::{
    AlarmFrame, FrameRow, FrameStore, SqliteFrameStore,
};
use zmwatch::keys::build_local_path;
use zmwatch::test_utils::init_test_logging;
use zmwatch::time_util::parse_recorder_timestamp;
use zmwatch::upload::{CycleError, UploadSettings, Uploader};
use zmwatch::{AppState, ServiceStats};

const BUCKET: &str = "test-bucket";

/// Frame store that counts marks on top of the SQLite store.
struct CountingStore {
    inner: SqliteFrameStore,
    marks: AtomicUsize,
}

#[async_trait]
impl FrameStore for CountingStore {
    async fn find_unuploaded_frames(
        &self,
        frame_type: &str,
        limit: usize,
        since: NaiveDateTime,
    ) -> Result<Vec<FrameRow>> {
        self.inner.find_unuploaded_frames(frame_type, limit, since).await
    }

    async fn mark_uploaded(&self, frame_id: i64, event_id: i64) -> Result<()> {
        self.marks.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_uploaded(frame_id, event_id).await
    }
}

struct Fixture {
    state: AppState,
    images: tempfile::TempDir,
    store: Arc<CountingStore>,
    blob: Arc<MemoryBlobStore>,
}

impl Fixture {
    /// `frames` frames of event 123 on FrontPorch, each with a JPEG on disk.
    fn new(frames: i64) -> Self {
        init_test_logging();
        let state = AppState::new_for_testing();
        let images = tempfile::tempdir().unwrap();
        {
            let conn = state.frames_db.get().unwrap();
            conn.execute_batch(
                "INSERT INTO Monitors (Id, Name) VALUES (1, 'FrontPorch');
                 INSERT INTO Events (Id, MonitorId, Name, StartTime)
                    VALUES (123, 1, 'New Event', '2018-06-20 09:19:50');",
            )
            .unwrap();
        }
        let store = Arc::new(CountingStore {
            inner: SqliteFrameStore::new(state.frames_db.clone()),
            marks: AtomicUsize::new(0),
        });
        let fixture = Self {
            state,
            images,
            store,
            blob: Arc::new(MemoryBlobStore::new()),
        };
        for frame_id in 1..=frames {
            fixture.add_frame(123, frame_id);
        }
        fixture
    }

    fn base(&self) -> String {
        self.images.path().to_str().unwrap().to_string()
    }

    fn frame(&self, event_id: i64, frame_id: i64) -> AlarmFrame {
        AlarmFrame {
            monitor_name: "FrontPorch".into(),
            event_id,
            frame_id,
            event_name: "New Event".into(),
            frame_timestamp: parse_recorder_timestamp(&format!(
                "2018-06-20 09:20:{:02}",
                frame_id
            ))
            .unwrap(),
            delta: frame_id as f64 + 0.25,
            event_start: parse_recorder_timestamp("2018-06-20 09:19:50").unwrap(),
            score: 10,
        }
    }

    fn path(&self, frame_id: i64) -> String {
        build_local_path(&self.frame(123, frame_id), &self.base(), 5)
    }

    fn add_frame(&self, event_id: i64, frame_id: i64) {
        let frame = self.frame(event_id, frame_id);
        let conn = self.state.frames_db.get().unwrap();
        conn.execute(
            "INSERT INTO Frames (EventId, FrameId, Type, TimeStamp, Delta, Score)
             VALUES (?, ?, 'Alarm', ?, ?, ?)",
            rusqlite::params![
                event_id,
                frame_id,
                frame.frame_timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                frame.delta,
                frame.score
            ],
        )
        .unwrap();
        let path = build_local_path(&frame, &self.base(), 5);
        std::fs::create_dir_all(std::path::Path::new(&path).parent().unwrap())
            .unwrap();
        std::fs::write(&path, format!("jpeg {frame_id}")).unwrap();
    }

    fn settings(&self) -> UploadSettings {
        UploadSettings {
            image_base_path: self.base(),
            bucket: BUCKET.to_string(),
            alert_labels: vec!["person".to_string()],
            poll_interval: Duration::from_millis(10),
            ..UploadSettings::default()
        }
    }

    fn uploader(
        &self,
        backend: Arc<FakeDetectionBackend>,
        settings: UploadSettings,
    ) -> Uploader {
        Uploader::new(
            self.store.clone(),
            self.blob.clone(),
            Dispatcher::new(backend, None),
            settings,
            Arc::new(ServiceStats::new()),
        )
    }

    fn marks(&self) -> usize {
        self.store.marks.load(Ordering::SeqCst)
    }

    fn marked_rows(&self) -> i64 {
        let conn = self.state.frames_db.get().unwrap();
        conn.query_row("SELECT COUNT(*) FROM alarm_uploaded", [], |row| row.get(0))
            .unwrap()
    }
}

#[tokio::test]
async fn test_one_alert_among_three_frames() {
    let fixture = Fixture::new(3);
    let backend = Arc::new(
        FakeDetectionBackend::new()
            .with_labels(&fixture.path(2), vec![Label::new("person", 92.0)]),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let uploader = fixture
        .uploader(backend.clone(), fixture.settings())
        .with_downstream(tx);

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.found, 3);
    assert_eq!(report.processed, 3);
    assert_eq!(report.uploaded, 3);
    assert_eq!(report.skipped, 0);

    // One batch, every frame submitted once.
    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 3);

    let keys = fixture.blob.keys(BUCKET);
    assert_eq!(keys.len(), 3);
    let mut alerts = 0;
    for key in &keys {
        assert!(key.starts_with("upload/FrontPorch/2018-6-20/hour-9/New_Event-ID_123-Frame_"));
        let object = fixture.blob.object(BUCKET, key).unwrap();
        if object.metadata[meta::ALERT] == "true" {
            alerts += 1;
            assert!(key.contains("-Frame_2-"));
            let labels: Vec<Label> =
                serde_json::from_str(&object.metadata[meta::LABELS]).unwrap();
            assert_eq!(labels, vec![Label::new("person", 92.0)]);
            assert_eq!(object.body, b"jpeg 2".to_vec());
        } else {
            assert!(!object.metadata.contains_key(meta::LABELS));
        }
        assert_eq!(object.metadata[meta::EVENT_ID], "123");
    }
    assert_eq!(alerts, 1);

    assert_eq!(fixture.marks(), 3);
    let mut handed_off = 0;
    while rx.try_recv().is_ok() {
        handed_off += 1;
    }
    assert_eq!(handed_off, 3);

    // Everything is marked, so the next cycle finds nothing.
    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_frame_skip_samples_per_monitor() {
    let fixture = Fixture::new(4);
    let backend = Arc::new(FakeDetectionBackend::new());
    let audit = Arc::new(RecordingAuditLog::new());
    let settings = UploadSettings {
        frame_skip: 1,
        ..fixture.settings()
    };
    let uploader = fixture
        .uploader(backend.clone(), settings)
        .with_audit(audit.clone());
    assert!(uploader.capabilities().audit_log);

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.uploaded, 2);

    assert_eq!(
        backend.calls(),
        vec![vec![fixture.path(1), fixture.path(3)]]
    );
    assert_eq!(fixture.marks(), 4);
    assert_eq!(fixture.marked_rows(), 4);

    let entries = audit.entries();
    assert_eq!(entries.len(), 4);
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.status == AuditStatus::Skipped)
            .count(),
        2
    );
}

#[tokio::test]
async fn test_bad_frame_is_not_marked() {
    let fixture = Fixture::new(2);
    {
        let conn = fixture.state.frames_db.get().unwrap();
        conn.execute_batch(
            "INSERT INTO Events (Id, MonitorId, Name, StartTime)
                VALUES (124, 1, NULL, '2018-06-20 09:30:00');
             INSERT INTO Frames (EventId, FrameId, Type, TimeStamp, Delta, Score)
                VALUES (124, 1, 'Alarm', '2018-06-20 09:30:01', 1.0, 5);",
        )
        .unwrap();
    }
    let backend = Arc::new(FakeDetectionBackend::new());
    let uploader = fixture.uploader(backend, fixture.settings());

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.found, 3);
    assert_eq!(report.bad, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(fixture.marks(), 2);
}

#[tokio::test]
async fn test_bad_frames_do_not_block_the_poll() {
    let fixture = Fixture::new(2);
    {
        let conn = fixture.state.frames_db.get().unwrap();
        conn.execute_batch(
            "INSERT INTO Events (Id, MonitorId, Name, StartTime)
                VALUES (122, 1, 'New Event', '2018-06-20 09:10:00');
             INSERT INTO Frames (EventId, FrameId, Type, TimeStamp, Delta, Score)
                VALUES (122, 1, 'Alarm', 'not a time', 1.0, 5);",
        )
        .unwrap();
    }
    let backend = Arc::new(FakeDetectionBackend::new());
    let settings = UploadSettings {
        max_records: 1,
        ..fixture.settings()
    };
    let uploader = fixture.uploader(backend, settings);

    // The bad frame sorts first and fills the poll once.
    let report = uploader.run_cycle().await.unwrap();
    assert_eq!((report.found, report.bad, report.processed), (1, 1, 0));

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!((report.found, report.bad, report.processed), (1, 0, 1));
    let report = uploader.run_cycle().await.unwrap();
    assert_eq!((report.found, report.bad, report.processed), (1, 0, 1));
    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.found, 0);

    // Still never marked.
    assert_eq!(fixture.marks(), 2);
}

#[tokio::test]
async fn test_batches_mark_every_good_frame_once() {
    let fixture = Fixture::new(7);
    let backend = Arc::new(FakeDetectionBackend::new());
    let settings = UploadSettings {
        max_concurrent_upload: 3,
        ..fixture.settings()
    };
    let uploader = fixture.uploader(backend.clone(), settings);

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.processed, 7);
    assert_eq!(
        backend.calls().iter().map(Vec::len).collect::<Vec<_>>(),
        vec![3, 3, 1]
    );
    assert_eq!(fixture.marks(), 7);
    assert_eq!(fixture.marked_rows(), 7);
}

#[tokio::test]
async fn test_false_positives_dropped_when_not_kept() {
    let fixture = Fixture::new(3);
    let backend = Arc::new(
        FakeDetectionBackend::new()
            .with_labels(&fixture.path(1), vec![Label::new("person", 80.0)])
            .with_labels(&fixture.path(3), vec![Label::new("cat", 99.0)]),
    );
    let settings = UploadSettings {
        keep_false_positives: false,
        ..fixture.settings()
    };
    let uploader = fixture.uploader(backend, settings);
    assert!(!uploader.capabilities().keep_false_positives);

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.processed, 3);
    let keys = fixture.blob.keys(BUCKET);
    assert_eq!(keys.len(), 1);
    assert!(keys[0].contains("-Frame_1-"));
    assert_eq!(fixture.marks(), 3);
}

#[tokio::test]
async fn test_failed_put_is_transient_and_retried() {
    let fixture = Fixture::new(3);
    let backend = Arc::new(FakeDetectionBackend::new());
    let uploader = fixture.uploader(backend, fixture.settings());

    fixture.blob.fail_next_puts(1);
    let err = uploader.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Transient(_)));
    // The frames that made it are marked, the failed one is left for later.
    assert_eq!(fixture.marks(), 2);
    assert_eq!(fixture.blob.keys(BUCKET).len(), 2);

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(fixture.marks(), 3);
    assert_eq!(fixture.blob.keys(BUCKET).len(), 3);
}

#[tokio::test]
async fn test_detection_failure_is_fatal() {
    let fixture = Fixture::new(2);
    let backend = Arc::new(FakeDetectionBackend::new().failing("detector down"));
    let uploader = fixture.uploader(backend, fixture.settings());

    let err = uploader.run_cycle().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(fixture.marks(), 0);
    assert!(fixture.blob.keys(BUCKET).is_empty());
}

#[tokio::test]
async fn test_run_loop_records_stats_and_stops() {
    let fixture = Fixture::new(3);
    let backend = Arc::new(FakeDetectionBackend::new());
    let stats = Arc::new(ServiceStats::new());
    let uploader = Arc::new(Uploader::new(
        fixture.store.clone(),
        fixture.blob.clone(),
        Dispatcher::new(backend, None),
        fixture.settings(),
        stats.clone(),
    ));

    let token = CancellationToken::new();
    let handle = tokio::spawn(uploader.run(token.clone()));

    for _ in 0..500 {
        if stats.snapshot().frames_uploaded == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    handle.await.unwrap().unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.frames_uploaded, 3);
    assert_eq!(snapshot.frames_found, 3);
    assert!(snapshot.cycles >= 1);
    assert_eq!(snapshot.error_count, 0);
}

#[tokio::test]
async fn test_run_loop_exits_on_fatal_error() {
    let fixture = Fixture::new(1);
    let backend = Arc::new(FakeDetectionBackend::new().failing("detector down"));
    let uploader = Arc::new(fixture.uploader(backend, fixture.settings()));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        uploader.run(CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_remote_labels_are_classified_by_trigger_words() {
    let fixture = Fixture::new(2);
    let backend = Arc::new(
        FakeDetectionBackend::new()
            .with_mode(DetectionMode::Remote)
            .with_labels(&fixture.path(1), vec![Label::new("Tree", 99.0)])
            .with_labels(&fixture.path(2), vec![Label::new("Person", 95.0)]),
    );
    let settings = UploadSettings {
        alert_labels: Vec::new(),
        trigger_words: DEFAULT_TRIGGER_WORDS.iter().map(|w| w.to_string()).collect(),
        ..fixture.settings()
    };
    let (tx, mut rx) = mpsc::channel(16);
    let uploader = fixture.uploader(backend, settings).with_downstream(tx);

    let report = uploader.run_cycle().await.unwrap();
    assert_eq!(report.uploaded, 2);

    let assessor = Arc::new(FakeStoredImageDetector::new(vec![Label::new("Person", 90.0)]));
    let dir = tempfile::tempdir().unwrap();
    let ctx = ChainContext {
        blob: fixture.blob.clone(),
        index: Arc::new(SqliteAlarmIndex::new(fixture.state.zmwatch_db.clone())),
        assessor: Some(assessor.clone() as Arc<dyn StoredImageDetector>),
        notifier: Arc::new(FakeNotifier::new()),
        cache_path: dir.path().join("alarm_cache"),
        config: Arc::new(PipelineConfig::default()),
        timezone: chrono_tz::America::Los_Angeles,
    };

    let mut outcomes = Vec::new();
    while let Ok(object) = rx.try_recv() {
        outcomes.push(process_uploaded(&ctx, &object).await.unwrap());
    }
    outcomes.sort_by(|a, b| a.archived.key.cmp(&b.archived.key));
    assert_eq!(outcomes.len(), 2);

    // The uploader already decided, so the stored objects are not relabelled.
    assert!(assessor.calls().is_empty());

    assert!(outcomes[0].alert);
    assert!(outcomes[0].archived.key.starts_with("archive/alerts/FrontPorch/"));
    assert!(outcomes[0].archived.key.contains("-Frame_2-"));
    assert!(outcomes[0].record.is_some());

    assert!(!outcomes[1].alert);
    assert!(outcomes[1]
        .archived
        .key
        .starts_with("archive/falsepositives/FrontPorch/"));
    assert!(outcomes[1].record.is_none());
}

#[tokio::test]
async fn test_alert_metadata_keeps_every_label() {
    let fixture = Fixture::new(1);
    let backend = Arc::new(FakeDetectionBackend::new().with_labels(
        &fixture.path(1),
        vec![Label::new("person", 92.0), Label::new("car", 80.0)],
    ));
    let uploader = fixture.uploader(backend, fixture.settings());
    uploader.run_cycle().await.unwrap();

    let keys = fixture.blob.keys(BUCKET);
    let object = fixture.blob.object(BUCKET, &keys[0]).unwrap();
    assert_eq!(object.metadata[meta::ALERT], "true");
    let labels: Vec<Label> =
        serde_json::from_str(&object.metadata[meta::LABELS]).unwrap();
    assert_eq!(labels, vec![Label::new("person", 92.0), Label::new("car", 80.0)]);
}

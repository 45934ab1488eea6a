//! The PII scrubber as a hard gate on outbound telemetry.

use std::sync::Arc;

use studyhall::ports::{
    BlobStorePort, ManualClock, MemoryBlobStore, MemoryVectorStore, SledStore,
};
use studyhall::telemetry::{
    hour_bucket, TelemetryConfig, TelemetryEvent, TelemetryPipeline, TelemetryRecorder,
};

fn event_with_subject(subject: &str) -> TelemetryEvent {
    TelemetryEvent {
        hour_bucket: hour_bucket("2026-03-02T10:15:00Z".parse().unwrap()),
        latency_ms: 120,
        success: true,
        error_kind: None,
        subject_id: subject.into(),
        vkp_version: Some("1.0.0".into()),
        cache_hit: false,
    }
}

struct Fixture {
    pipeline: TelemetryPipeline,
    recorder: Arc<TelemetryRecorder>,
    local: Arc<MemoryBlobStore>,
    remote: Arc<MemoryBlobStore>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(TelemetryRecorder::new(64));
    let local = Arc::new(MemoryBlobStore::new());
    let remote = Arc::new(MemoryBlobStore::new());
    let pipeline = TelemetryPipeline::new(
        recorder.clone(),
        local.clone(),
        Some(remote.clone() as Arc<dyn BlobStorePort>),
        Arc::new(SledStore::open(dir.path().join("db")).unwrap()),
        Arc::new(MemoryVectorStore::new()),
        Arc::new(ManualClock::new("2026-03-02T11:00:00Z".parse().unwrap())),
        TelemetryConfig {
            school_id: Some("SDN 4 Contoh".into()),
            school_salt: "pepper".into(),
            max_queued: 16,
        },
    );
    Fixture {
        pipeline,
        recorder,
        local,
        remote,
        _dir: dir,
    }
}

#[tokio::test]
async fn payload_with_an_email_is_dropped_whole() {
    let fx = fixture();
    // A synthetic event smuggling an address through an enumerated field.
    fx.recorder.record(event_with_subject("student@school.id"));

    let enqueued = fx.pipeline.aggregate_and_enqueue().await.unwrap();
    assert_eq!(enqueued, 0);
    assert_eq!(fx.recorder.counters().scrub_dropped, 1);
    assert!(fx.local.list("telemetry/").await.unwrap().is_empty());

    // Nothing to push either; the string never leaves the node.
    assert_eq!(fx.pipeline.push_pending().await.unwrap(), 0);
    assert!(fx.remote.is_empty());
}

#[tokio::test]
async fn clean_events_upload_without_school_name() {
    let fx = fixture();
    fx.recorder.record(event_with_subject("math"));
    fx.recorder.record(event_with_subject("science"));

    fx.pipeline.tick().await;

    let keys = fx.remote.list("telemetry/inbox/").await.unwrap();
    assert_eq!(keys.len(), 1);
    let (bytes, _) = fx.remote.get(&keys[0]).await.unwrap();
    let payload = String::from_utf8(bytes).unwrap();
    assert!(!payload.contains("Contoh"));
    assert!(payload.contains("\"node\":\"sh-"));
    assert!(payload.contains("\"math\":1"));
    assert_eq!(fx.recorder.counters().scrub_dropped, 0);
}

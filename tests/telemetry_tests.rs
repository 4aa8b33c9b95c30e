use narrator::kernel::telemetry::event::{CooldownKind, TelemetryEvent};
use narrator::kernel::telemetry::metrics::TelemetrySnapshot;
use narrator::kernel::telemetry::recorder::TelemetryRecorder;

#[test]
fn long_sessions_keep_exact_counts() {
    let mut recorder = TelemetryRecorder::new();
    for i in 0..30_000 {
        recorder.record(TelemetryEvent::RequestSent { credential: i % 3 });
        recorder.record(TelemetryEvent::SegmentGenerated {
            segment: i,
            audio_ms: 2,
        });
    }
    recorder.record(TelemetryEvent::RateLimited);

    let snap = recorder.snapshot();
    assert_eq!(snap.requests.sent, 30_000);
    assert_eq!(snap.requests.generated, 30_000);
    assert_eq!(snap.requests.per_credential, vec![10_000, 10_000, 10_000]);
    assert_eq!(snap.requests.rate_limited, 1);
    assert_eq!(snap.playback.audio_ms, 60_000);
}

#[test]
fn waits_and_underruns_accumulate() {
    let mut recorder = TelemetryRecorder::new();
    recorder.record(TelemetryEvent::Cooldown {
        kind: CooldownKind::PoolSaturated,
        duration_ms: 1_500,
    });
    recorder.record(TelemetryEvent::Cooldown {
        kind: CooldownKind::RateLimited,
        duration_ms: 8_000,
    });
    recorder.record(TelemetryEvent::Backoff { duration_ms: 400 });
    recorder.record(TelemetryEvent::Underrun { gap_ms: 30 });
    recorder.record(TelemetryEvent::Underrun { gap_ms: 120 });
    recorder.record(TelemetryEvent::CredentialSkipped { credential: 1 });
    recorder.record(TelemetryEvent::SegmentFailed { segment: 4 });

    let snap = recorder.snapshot();
    assert_eq!(snap.waits.saturated_cooldowns, 1);
    assert_eq!(snap.waits.rate_limit_cooldowns, 1);
    assert_eq!(snap.waits.cooldown_ms, 9_500);
    assert_eq!(snap.waits.backoffs, 1);
    assert_eq!(snap.waits.backoff_ms, 400);
    assert_eq!(snap.playback.underruns, 2);
    assert_eq!(snap.playback.max_underrun_ms, 120);
    assert_eq!(snap.requests.credential_skips, 1);
    assert_eq!(snap.requests.failed_segments, 1);
}

#[test]
fn snapshot_serializes_to_json() {
    let mut recorder = TelemetryRecorder::new();
    recorder.record(TelemetryEvent::RequestSent { credential: 0 });
    let snap = recorder.snapshot();

    let json = serde_json::to_value(&snap).unwrap();
    assert_eq!(json["requests"]["sent"], 1);
    assert_eq!(json["requests"]["per_credential"][0], 1);

    let back: TelemetrySnapshot = serde_json::from_value(json).unwrap();
    assert_eq!(back, snap);
}

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use common::{pcm, quiet_config, ScriptedSynthesizer};
use narrator::audio::VirtualBackend;
use narrator::config::NarratorConfig;
use narrator::kernel::credentials::{ApiKey, CredentialId, CredentialPool};
use narrator::kernel::event::{CooldownReason, PipelineEvent, RetryCause};
use narrator::kernel::segment::{SegmentId, SegmentStatus};
use narrator::{Coordinator, SessionHandle, SessionStatus, SynthesisError, SynthesisRequest, Synthesizer, VoiceParams};

/// Five paragraphs of 41 characters; a 50 character limit splits them apart.
fn five_paragraphs() -> String {
    (1..=5)
        .map(|i| format!("Paragraph {} carries a short line of text.", i))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn start(config: NarratorConfig, synth: ScriptedSynthesizer, text: &str) -> (SessionHandle, Arc<ScriptedSynthesizer>) {
    let synth = Arc::new(synth);
    let coordinator = Coordinator::new(config, synth.clone());
    let handle = coordinator.start(text, VoiceParams::default(), Box::new(VirtualBackend::new()));
    (handle, synth)
}

async fn drain(handle: &mut SessionHandle) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(e) = handle.next_event().await {
        events.push(e);
    }
    events
}

fn index_of(events: &[PipelineEvent], wanted: impl Fn(&PipelineEvent) -> bool) -> usize {
    events.iter().position(|e| wanted(e)).unwrap()
}

fn statuses(events: &[PipelineEvent]) -> Vec<SessionStatus> {
    let mut out: Vec<SessionStatus> = Vec::new();
    for e in events {
        if let PipelineEvent::Status(update) = e {
            if out.last() != Some(&update.status) {
                out.push(update.status);
            }
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn saturated_key_cools_down_before_third_request() {
    let mut config = quiet_config(&["only-key"]);
    config.segmenter.max_length = 50;
    config.rate_limit.limit = 2;
    config.rate_limit.window_ms = 60_000;

    let (mut handle, synth) = start(config, ScriptedSynthesizer::new(0.5), &five_paragraphs());
    let events = drain(&mut handle).await;
    let report = handle.join().await.unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.segments.len(), 5);
    assert!(report.segments.iter().all(|s| s.status == SegmentStatus::Played));
    assert_eq!(synth.calls(), 5);

    let sends: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, PipelineEvent::RequestSent { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(sends.len(), 5);

    let saturated_before_third = events[sends[1]..sends[2]].iter().any(|e| {
        matches!(
            e,
            PipelineEvent::Cooldown { reason: CooldownReason::PoolSaturated, remaining, .. } if !remaining.is_zero()
        )
    });
    assert!(saturated_before_third, "no cooldown between the 2nd and 3rd request");

    assert_eq!(report.telemetry.requests.sent, 5);
    assert_eq!(report.telemetry.requests.generated, 5);
    assert!(report.telemetry.waits.saturated_cooldowns >= 2);
    assert!(matches!(events.last(), Some(PipelineEvent::Summary(_))));
}

#[tokio::test(start_paused = true)]
async fn segments_play_back_to_back_in_text_order() {
    let mut config = quiet_config(&["k0", "k1"]);
    config.segmenter.max_length = 50;

    let (mut handle, _synth) = start(config, ScriptedSynthesizer::new(0.5), &five_paragraphs());
    let events = drain(&mut handle).await;

    let starts: Vec<(SegmentId, f64)> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::SegmentStarted { segment, at_secs } => Some((*segment, *at_secs)),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 5);
    for (i, pair) in starts.windows(2).enumerate() {
        assert_eq!(pair[0].0, SegmentId(i));
        assert_eq!(pair[1].0, SegmentId(i + 1));
        assert!((pair[1].1 - pair[0].1 - 0.5).abs() < 1e-9, "gap between {} and {}", i, i + 1);
    }

    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.telemetry.playback.underruns, 0);
    // Played audio is released unless asked to keep it
    assert_eq!(report.audio().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn fetching_stays_inside_the_look_ahead_window() {
    let mut config = quiet_config(&["k0"]);
    config.segmenter.max_length = 50;
    config.pipeline.look_ahead = 1;

    let (mut handle, _synth) = start(config, ScriptedSynthesizer::new(5.0), &five_paragraphs());
    let events = drain(&mut handle).await;

    let third_request = index_of(&events, |e| matches!(e, PipelineEvent::RequestSent { segment: SegmentId(2), .. }));
    let second_started = index_of(&events, |e| matches!(e, PipelineEvent::SegmentStarted { segment: SegmentId(1), .. }));
    assert!(second_started < third_request);

    // Still Processing while later segments wait outside the window
    let last_request = index_of(&events, |e| matches!(e, PipelineEvent::RequestSent { segment: SegmentId(4), .. }));
    let first_playing = index_of(
        &events,
        |e| matches!(e, PipelineEvent::Status(update) if update.status == SessionStatus::Playing),
    );
    assert!(last_request < first_playing);

    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_parks_the_session_until_resume() {
    let synth = ScriptedSynthesizer::new(0.5).then(Err(SynthesisError::Auth("401 key revoked".into())));
    let (mut handle, synth) = start(quiet_config(&["k0"]), synth, "A single short passage.");

    let mut seen_failure = false;
    loop {
        match handle.next_event().await {
            Some(PipelineEvent::SegmentFailed { segment, error }) => {
                assert_eq!(segment, SegmentId(0));
                assert!(matches!(error, SynthesisError::Auth(_)));
                seen_failure = true;
            }
            Some(PipelineEvent::Status(update)) if update.status == SessionStatus::Error => {
                assert!(update.message.contains("key revoked"));
                break;
            }
            Some(_) => {}
            None => panic!("session ended without reporting the failure"),
        }
    }
    assert!(seen_failure);
    assert_eq!(synth.calls(), 1);

    handle.resume();
    let rest = drain(&mut handle).await;
    assert!(rest
        .iter()
        .any(|e| matches!(e, PipelineEvent::SegmentReady { segment: SegmentId(0), .. })));

    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.segments[0].status, SegmentStatus::Played);
    assert_eq!(report.segments[0].error, None);
    assert_eq!(report.telemetry.requests.failed_segments, 1);
    assert_eq!(synth.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_session_idle() {
    let mut config = quiet_config(&["k0"]);
    config.segmenter.max_length = 50;

    let (mut handle, _synth) = start(config, ScriptedSynthesizer::new(2.0), &five_paragraphs());
    while let Some(event) = handle.next_event().await {
        if matches!(event, PipelineEvent::SegmentStarted { .. }) {
            handle.stop();
            break;
        }
    }
    let rest = drain(&mut handle).await;
    assert!(!rest.iter().any(|e| matches!(e, PipelineEvent::SegmentEnded { .. })));

    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Idle);
    assert!(report.segments.iter().all(|s| s.status != SegmentStatus::Played));
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_round_trip() {
    let mut config = quiet_config(&["k0"]);
    config.segmenter.max_length = 50;

    let (mut handle, _synth) = start(config, ScriptedSynthesizer::new(1.0), &five_paragraphs());
    while let Some(event) = handle.next_event().await {
        if matches!(event, PipelineEvent::SegmentStarted { .. }) {
            handle.pause();
            break;
        }
    }

    loop {
        match handle.next_event().await {
            Some(PipelineEvent::Status(update)) if update.status == SessionStatus::Paused => break,
            Some(PipelineEvent::SegmentEnded { .. }) => panic!("playback advanced while paused"),
            Some(_) => {}
            None => panic!("session ended while paused"),
        }
    }
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    handle.resume();

    let events = drain(&mut handle).await;
    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::SegmentEnded { .. }))
            .count(),
        5
    );
}

#[tokio::test(start_paused = true)]
async fn retained_audio_exports_in_order() {
    let mut config = quiet_config(&["k0"]);
    config.segmenter.max_length = 50;
    config.pipeline.retain_audio = true;

    let (mut handle, _synth) = start(config, ScriptedSynthesizer::new(0.25), &five_paragraphs());
    let _ = drain(&mut handle).await;
    let report = handle.join().await.unwrap();

    assert_eq!(report.audio().count(), 5);
    let path = std::env::temp_dir().join(format!("narrator-export-{}.wav", report.id));
    assert_eq!(report.export_wav(&path, common::RATE).unwrap(), 5);

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().sample_rate, common::RATE);
    assert_eq!(reader.len(), 5 * 6_000);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test(start_paused = true)]
async fn blank_text_completes_immediately() {
    let (mut handle, synth) = start(quiet_config(&["k0"]), ScriptedSynthesizer::new(0.5), "  \n\n  ");
    let events = drain(&mut handle).await;
    let report = handle.join().await.unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert!(report.segments.is_empty());
    assert_eq!(synth.calls(), 0);
    assert_eq!(
        statuses(&events),
        vec![SessionStatus::Preparing, SessionStatus::Completed]
    );
}

async fn wait_for_error(handle: &mut SessionHandle) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match handle.next_event().await {
            Some(PipelineEvent::Status(update)) if update.status == SessionStatus::Error => return events,
            Some(event) => events.push(event),
            None => panic!("session ended without reaching Error"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn resume_after_failure_while_paused_restarts_the_clock() {
    let mut config = quiet_config(&["k0"]);
    config.segmenter.max_length = 50;
    let synth = ScriptedSynthesizer::new(0.5)
        .then(Ok(pcm(0.5)))
        .then(Err(SynthesisError::Auth("401 key revoked".into())));

    let (mut handle, synth) = start(config, synth, &five_paragraphs());
    handle.pause();

    let before = wait_for_error(&mut handle).await;
    assert!(before
        .iter()
        .any(|e| matches!(e, PipelineEvent::Status(update) if update.status == SessionStatus::Paused)));
    assert!(!before.iter().any(|e| matches!(e, PipelineEvent::SegmentStarted { .. })));

    handle.resume();
    let finished = tokio::time::timeout(Duration::from_secs(600), drain(&mut handle)).await;
    let events = finished.expect("session did not finish after resuming");
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::SegmentEnded { .. }))
            .count(),
        5
    );

    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(synth.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn oversized_retry_hint_is_capped() {
    let mut config = quiet_config(&["k0"]);
    config.retry.max_suggested_wait_ms = 20_000;
    let synth = ScriptedSynthesizer::new(0.5).then(Err(SynthesisError::rate_limited(
        r#"{"error":{"details":[{"retryDelay":"9999999999s"}]}}"#,
    )));

    let (mut handle, synth) = start(config, synth, "A single short passage.");
    let finished = tokio::time::timeout(Duration::from_secs(600), drain(&mut handle)).await;
    let events = finished.expect("session hung on the retry hint");

    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Retrying {
                cause: RetryCause::RateLimited,
                delay,
                ..
            } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Duration::from_secs(20)]);

    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(synth.calls(), 2);
}

/// Panics on its first call, then returns half a second of silence.
struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for PanicsOnce {
    async fn synthesize(&self, _key: &ApiKey, _request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("synthesizer blew up");
        }
        Ok(pcm(0.5))
    }
}

#[tokio::test(start_paused = true)]
async fn crashed_fetch_task_surfaces_as_segment_failure() {
    let synth = Arc::new(PanicsOnce {
        calls: AtomicUsize::new(0),
    });
    let coordinator = Coordinator::new(quiet_config(&["k0"]), synth.clone());
    let mut handle = coordinator.start(
        "A single short passage.",
        VoiceParams::default(),
        Box::new(VirtualBackend::new()),
    );

    let finished = tokio::time::timeout(Duration::from_secs(600), wait_for_error(&mut handle)).await;
    let before = finished.expect("crashed fetch left the session hanging");
    assert!(before.iter().any(|e| matches!(
        e,
        PipelineEvent::SegmentFailed { segment: SegmentId(0), error: SynthesisError::Transient(_) }
    )));

    handle.resume();
    let _ = drain(&mut handle).await;
    let report = handle.join().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn skipping_a_credential_moves_the_retry_to_the_next_key() {
    let config = quiet_config(&["k0", "k1"]);
    let pool = Arc::new(CredentialPool::new(["k0", "k1"], &config.rate_limit));
    // Even loads keep key#0 first in line after its rejection
    pool.record_use(CredentialId(1)).unwrap();

    let synth = Arc::new(
        ScriptedSynthesizer::new(0.5).then(Err(SynthesisError::rate_limited("Please retry in 30s."))),
    );
    let coordinator = Coordinator::with_pool(config, synth.clone(), pool);
    let mut handle = coordinator.start(
        "A single short passage.",
        VoiceParams::default(),
        Box::new(VirtualBackend::new()),
    );
    let started = Instant::now();

    loop {
        match handle.next_event().await {
            Some(PipelineEvent::Retrying { cause: RetryCause::RateLimited, .. }) => break,
            Some(_) => {}
            None => panic!("session ended before the rate limit"),
        }
    }
    handle.skip_credential();

    let events = drain(&mut handle).await;
    let skipped = index_of(
        &events,
        |e| matches!(e, PipelineEvent::CredentialSkipped { credential: CredentialId(0) }),
    );
    let resent = index_of(&events, |e| matches!(e, PipelineEvent::RequestSent { attempt: 2, .. }));
    assert!(skipped < resent);
    assert!(matches!(
        events[resent],
        PipelineEvent::RequestSent { credential: CredentialId(1), .. }
    ));

    let id = handle.id();
    let report = handle.join().await.unwrap();
    assert_eq!(report.id, id);
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.telemetry.requests.credential_skips, 1);
    // Far short of the 30s the server asked for
    assert!(started.elapsed() < Duration::from_secs(10));

    let keys: Vec<String> = synth.seen().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["k0", "k1"]);
}

//! Pipeline coordinator.
//!
//! One task owns the session: it segments the text, keeps at most one
//! synthesis request in flight inside the look-ahead window, binds ready
//! audio to the playback clock in text order, and turns scheduler markers
//! into caller events. Everything it learns from the outside (commands,
//! client progress, fetch results, the cadence tick) arrives through
//! channels and is applied in a single `select!` loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancel::CancellationRegistry;
use super::credentials::{CredentialId, CredentialPool};
use super::event::{PipelineEvent, RetryCause, SessionCommand, StatusUpdate};
use super::retry::RetryPolicy;
use super::scheduler::{PlaybackMarker, PlaybackScheduler};
use super::segment::{Segment, SegmentId};
use super::segmenter::{build_segments, context_tail};
use super::state::{PipelineSession, SessionStatus, StateDelta};
use super::telemetry::event::TelemetryEvent;
use super::telemetry::metrics::TelemetrySnapshot;
use super::telemetry::recorder::TelemetryRecorder;
use super::time::{cadence, duration_ms, secs_to_ms};
use crate::audio::backend::AudioBackend;
use crate::audio::codec::{decode_pcm16, duration_secs, write_wav};
use crate::config::NarratorConfig;
use crate::error::{AudioError, SynthesisError};
use crate::services::synth::client::SynthesisClient;
use crate::services::synth::{SynthesisRequest, Synthesizer, VoiceParams};

// Results of spawned work, serialized back onto the driver
enum DriverEvent {
    FetchDone {
        id: SegmentId,
        result: Result<Vec<u8>, SynthesisError>,
    },
}

// Owned by a fetch task. If the task ends without delivering a result and
// nobody cancelled it (a panic inside the synthesizer), the driver still
// hears about it.
struct FetchGuard {
    id: SegmentId,
    tx: mpsc::UnboundedSender<DriverEvent>,
    token: CancellationToken,
    delivered: bool,
}

impl FetchGuard {
    fn deliver(mut self, result: Result<Vec<u8>, SynthesisError>) {
        self.delivered = true;
        let _ = self.tx.send(DriverEvent::FetchDone { id: self.id, result });
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if self.delivered || self.token.is_cancelled() {
            return;
        }
        let _ = self.tx.send(DriverEvent::FetchDone {
            id: self.id,
            result: Err(SynthesisError::Transient("synthesis task ended without a result".into())),
        });
    }
}

pub struct Coordinator {
    config: NarratorConfig,
    synthesizer: Arc<dyn Synthesizer>,
    pool: Arc<CredentialPool>,
}

impl Coordinator {
    /// Credential pool built from `config.endpoint.api_keys`.
    pub fn new(config: NarratorConfig, synthesizer: Arc<dyn Synthesizer>) -> Self {
        let pool = Arc::new(CredentialPool::new(
            config.endpoint.api_keys.iter().cloned(),
            &config.rate_limit,
        ));
        Self::with_pool(config, synthesizer, pool)
    }

    pub fn with_pool(config: NarratorConfig, synthesizer: Arc<dyn Synthesizer>, pool: Arc<CredentialPool>) -> Self {
        Self {
            config,
            synthesizer,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Start reading `text` aloud through `backend`. Must be called inside a
    /// tokio runtime.
    pub fn start(&self, text: impl Into<String>, voice: VoiceParams, backend: Box<dyn AudioBackend>) -> SessionHandle {
        let text = text.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();

        let session = PipelineSession::new(self.config.pipeline.look_ahead);
        let id = session.id;

        let client = SynthesisClient::new(
            self.synthesizer.clone(),
            self.pool.clone(),
            RetryPolicy::from(&self.config.retry),
        )
        .with_events(progress_tx);

        let scheduler = PlaybackScheduler::new(
            backend,
            self.config.playback.sample_rate,
            self.config.playback.safety_lead_ms as f64 / 1000.0,
        );

        let driver = SessionDriver {
            session,
            scheduler,
            client,
            pool: self.pool.clone(),
            voice,
            config: self.config.clone(),
            cancel: CancellationRegistry::new(),
            telemetry: TelemetryRecorder::new(),
            events: event_tx,
            driver_tx,
            last_credential: None,
            resume_to: None,
            published: None,
        };

        let task = tokio::spawn(driver.run(text, command_rx, progress_rx, driver_rx));

        SessionHandle {
            id,
            control: SessionControl { commands: command_tx },
            events: event_rx,
            task,
        }
    }
}

/// Cloneable command side of a session.
#[derive(Debug, Clone)]
pub struct SessionControl {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionControl {
    pub fn pause(&self) {
        self.send(SessionCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(SessionCommand::Resume);
    }

    pub fn stop(&self) {
        self.send(SessionCommand::Stop);
    }

    pub fn skip_credential(&self) {
        self.send(SessionCommand::SkipCredential);
    }

    pub fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!("Session already finished, dropping {:?}", command);
        }
    }
}

pub struct SessionHandle {
    id: Uuid,
    control: SessionControl,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn skip_credential(&self) {
        self.control.skip_credential();
    }

    /// `None` once the session has finished and every event was drained.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Wait for the session to end. A session sitting in `Error` only ends
    /// on `stop`.
    pub async fn join(self) -> Result<SessionReport, JoinError> {
        self.task.await
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub status: SessionStatus,
    pub segments: Vec<Segment>,
    pub telemetry: TelemetrySnapshot,
}

impl SessionReport {
    /// Segments whose audio is still held, in text order. Played audio is
    /// only held when `pipeline.retain_audio` is set.
    pub fn audio(&self) -> impl Iterator<Item = &[f32]> {
        self.segments.iter().filter_map(|s| s.samples.as_deref())
    }

    /// Write the held audio as one WAV file. Returns how many segments went in.
    pub fn export_wav(&self, path: &Path, sample_rate: u32) -> Result<usize, AudioError> {
        let count = self.audio().count();
        write_wav(path, self.audio(), sample_rate)?;
        info!("Exported {} segments to {}", count, path.display());
        Ok(count)
    }
}

struct SessionDriver {
    session: PipelineSession,
    scheduler: PlaybackScheduler,
    client: SynthesisClient,
    pool: Arc<CredentialPool>,
    voice: VoiceParams,
    config: NarratorConfig,
    cancel: CancellationRegistry,
    telemetry: TelemetryRecorder,
    events: mpsc::UnboundedSender<PipelineEvent>,
    driver_tx: mpsc::UnboundedSender<DriverEvent>,
    last_credential: Option<CredentialId>,
    // Status to return to when a pause is lifted
    resume_to: Option<SessionStatus>,
    published: Option<(SessionStatus, u8, Option<usize>)>,
}

impl SessionDriver {
    async fn run(
        mut self,
        text: String,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut progress: mpsc::UnboundedReceiver<PipelineEvent>,
        mut driver: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> SessionReport {
        info!("Session {} starting", self.session.id);
        self.set_status(SessionStatus::Preparing, "Segmenting text");

        let segments = build_segments(&text, self.config.segmenter.max_length);
        if segments.is_empty() {
            self.set_status(SessionStatus::Completed, "Nothing to read");
            self.emit(PipelineEvent::Summary(self.telemetry.snapshot()));
            return self.finish();
        }
        info!("Text split into {} segments", segments.len());
        self.session.reduce(StateDelta::Segmented(segments));
        self.scheduler.init();
        self.set_status(SessionStatus::Processing, "Generating audio");

        let mut ticker = cadence(Duration::from_millis(self.config.playback.cadence_ms));

        loop {
            self.pump();
            self.refresh_status();
            if self.session.status().is_terminal() {
                break;
            }

            tokio::select! {
                biased;

                command = commands.recv() => {
                    // Handle dropped: nobody can stop us later, so stop now
                    self.on_command(command.unwrap_or(SessionCommand::Stop));
                }
                Some(event) = progress.recv() => {
                    self.on_progress(event);
                }
                Some(event) = driver.recv() => {
                    self.on_driver(event);
                }
                _ = ticker.tick() => {
                    self.on_cadence();
                }
            }
        }

        self.finish()
    }

    fn finish(mut self) -> SessionReport {
        self.cancel.cancel_all();
        let status = self.session.status();
        info!("Session {} finished: {:?}", self.session.id, status);
        let telemetry = self.telemetry.snapshot();
        SessionReport {
            id: self.session.id,
            status,
            segments: self.session.into_segments(),
            telemetry,
        }
    }

    /// Schedule whatever is ready, then start the next fetch if allowed.
    fn pump(&mut self) {
        let status = self.session.status();
        if !matches!(
            status,
            SessionStatus::Processing | SessionStatus::Playing | SessionStatus::Paused | SessionStatus::Error
        ) {
            return;
        }

        while let Some(id) = self.session.next_to_schedule() {
            let Some(placement) = self.scheduler.schedule_placement(id) else {
                break;
            };
            if placement.gap > 0.0 && id.index() > 0 {
                let gap_ms = secs_to_ms(placement.gap);
                debug!("Underrun before {}: {}ms of silence", id, gap_ms);
                self.telemetry.record(TelemetryEvent::Underrun { gap_ms });
            }
            self.session.reduce(StateDelta::Scheduled(id));
        }

        // Fetching carries on while paused; the look-ahead window bounds it
        if status == SessionStatus::Error || self.cancel.has_inflight() {
            return;
        }
        if let Some(id) = self.session.next_fetch() {
            self.spawn_fetch(id);
        }
    }

    fn spawn_fetch(&mut self, id: SegmentId) {
        let Some(segment) = self.session.segment(id) else {
            return;
        };
        let context = id
            .index()
            .checked_sub(1)
            .and_then(|prev| self.session.segment(SegmentId(prev)))
            .and_then(|prev| context_tail(&prev.text, self.config.segmenter.context_chars));
        let request = SynthesisRequest {
            text: segment.text.clone(),
            voice: self.voice.clone(),
            context,
        };

        debug!("Fetching {} ({} chars)", id, request.text.chars().count());
        self.session.reduce(StateDelta::FetchStarted(id));

        let token = self.cancel.child_token();
        let client = self.client.clone();
        let guard = FetchGuard {
            id,
            tx: self.driver_tx.clone(),
            token: token.clone(),
            delivered: false,
        };
        let task = tokio::spawn(async move {
            let result = client.synthesize(id, &request, &guard.token).await;
            guard.deliver(result);
        });
        self.cancel.register(id, token, task);
    }

    fn on_driver(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::FetchDone { id, result } => {
                if !self.cancel.complete(id) {
                    debug!("Dropping stale result for {}", id);
                    return;
                }
                match result {
                    Ok(bytes) => self.on_audio(id, &bytes),
                    Err(SynthesisError::Cancelled) => debug!("Fetch for {} cancelled", id),
                    Err(e) => self.fail_segment(id, e),
                }
            }
        }
    }

    fn on_audio(&mut self, id: SegmentId, bytes: &[u8]) {
        if self.cancel.is_cancelled() {
            return;
        }
        let samples = match decode_pcm16(bytes) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => {
                self.fail_segment(id, SynthesisError::InvalidRequest("endpoint returned no samples".into()));
                return;
            }
            Err(e) => {
                self.fail_segment(id, SynthesisError::InvalidRequest(format!("undecodable audio: {}", e)));
                return;
            }
        };

        let samples: Arc<[f32]> = samples.into();
        let duration = duration_secs(samples.len(), self.config.playback.sample_rate);
        info!("{} ready: {:.2}s of audio", id, duration);

        self.scheduler.enqueue(id, samples.clone());
        self.session.reduce(StateDelta::AudioReady {
            id,
            samples,
            duration_secs: duration,
        });
        self.telemetry.record(TelemetryEvent::SegmentGenerated {
            segment: id.index(),
            audio_ms: secs_to_ms(duration),
        });
        self.emit(PipelineEvent::SegmentReady {
            segment: id,
            duration_secs: duration,
        });
    }

    fn fail_segment(&mut self, id: SegmentId, err: SynthesisError) {
        error!("{} failed: {}", id, err);
        self.session.reduce(StateDelta::FetchFailed {
            id,
            error: err.to_string(),
        });
        self.telemetry.record(TelemetryEvent::SegmentFailed { segment: id.index() });
        let message = format!("Segment {} failed: {}", id.index() + 1, err);
        self.emit(PipelineEvent::SegmentFailed { segment: id, error: err });
        self.set_status(SessionStatus::Error, message);
    }

    fn on_progress(&mut self, event: PipelineEvent) {
        match &event {
            PipelineEvent::RequestSent { credential, .. } => {
                self.last_credential = Some(*credential);
                self.telemetry.record(TelemetryEvent::RequestSent {
                    credential: credential.0,
                });
            }
            PipelineEvent::Cooldown {
                reason,
                remaining,
                total,
                ..
            } if remaining == total => {
                self.telemetry.record(TelemetryEvent::Cooldown {
                    kind: (*reason).into(),
                    duration_ms: duration_ms(*total),
                });
            }
            PipelineEvent::Retrying { cause, delay, .. } => match cause {
                RetryCause::RateLimited => self.telemetry.record(TelemetryEvent::RateLimited),
                RetryCause::Transient => {
                    self.telemetry.record(TelemetryEvent::TransientFailure);
                    self.telemetry.record(TelemetryEvent::Backoff {
                        duration_ms: duration_ms(*delay),
                    });
                }
            },
            _ => {}
        }
        self.emit(event);
    }

    fn on_cadence(&mut self) {
        let mut ended = Vec::new();
        for marker in self.scheduler.poll() {
            match marker {
                PlaybackMarker::Started { id, at } => {
                    debug!("{} started at {:.3}s", id, at);
                    self.session.reduce(StateDelta::PlaybackStarted(id));
                    self.emit(PipelineEvent::SegmentStarted {
                        segment: id,
                        at_secs: at,
                    });
                }
                PlaybackMarker::Ended { id } => {
                    self.session.reduce(StateDelta::PlaybackEnded(id));
                    self.emit(PipelineEvent::SegmentEnded { segment: id });
                    ended.push(id);
                }
            }
        }

        if !ended.is_empty() {
            self.scheduler.prune(&ended);
            let keep = self.config.pipeline.retain_audio;
            for id in ended {
                self.session.reduce(StateDelta::Pruned { id, keep });
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        let status = self.session.status();
        match command {
            SessionCommand::Pause => match status {
                SessionStatus::Processing | SessionStatus::Playing => {
                    self.resume_to = Some(status);
                    self.scheduler.pause();
                    self.set_status(SessionStatus::Paused, "Paused");
                }
                _ => debug!("Pause ignored in {:?}", status),
            },
            SessionCommand::Resume => match status {
                SessionStatus::Paused => {
                    self.scheduler.resume();
                    let back = self.resume_to.take().unwrap_or(SessionStatus::Processing);
                    self.set_status(back, "Resumed");
                }
                SessionStatus::Error => {
                    let failed = self.session.failed();
                    info!("Re-queueing {} failed segment(s)", failed.len());
                    for id in failed {
                        self.session.reduce(StateDelta::Requeued(id));
                    }
                    // Also lifts a pause that was active when the fetch failed
                    self.resume_to = None;
                    if self.scheduler.is_paused() {
                        self.scheduler.resume();
                    }
                    self.set_status(SessionStatus::Processing, "Retrying");
                }
                _ => debug!("Resume ignored in {:?}", status),
            },
            SessionCommand::Stop => {
                info!("Stopping session {}", self.session.id);
                self.cancel.cancel_all();
                self.scheduler.stop();
                self.set_status(SessionStatus::Idle, "Stopped");
            }
            SessionCommand::SkipCredential => self.skip_credential(),
        }
    }

    /// Put the credential used last (or the one that would be used next)
    /// into a full-window cooldown.
    fn skip_credential(&mut self) {
        let target = self
            .last_credential
            .or_else(|| self.pool.peek_best().ok().map(|s| s.credential));
        let Some(credential) = target else {
            warn!("No credential to skip");
            return;
        };

        match self.pool.force_cooldown(credential) {
            Ok(()) => {
                info!("Skipping {} for the rest of its window", credential);
                self.telemetry.record(TelemetryEvent::CredentialSkipped {
                    credential: credential.0,
                });
                self.emit(PipelineEvent::CredentialSkipped { credential });
            }
            Err(e) => warn!("Cannot skip {}: {}", credential, e),
        }
    }

    /// Derive Processing/Playing/Completed from segment states and publish
    /// when anything the caller sees has changed. Processing lasts while any
    /// segment is still pending or being generated.
    fn refresh_status(&mut self) {
        let status = self.session.status();
        if matches!(status, SessionStatus::Processing | SessionStatus::Playing) {
            if self.session.all_played() {
                self.set_status(SessionStatus::Completed, "Finished");
                self.emit(PipelineEvent::Summary(self.telemetry.snapshot()));
                return;
            }
            let next = if self.cancel.has_inflight() || self.session.has_pending() {
                SessionStatus::Processing
            } else {
                SessionStatus::Playing
            };
            if next != status {
                let message = match next {
                    SessionStatus::Playing => "All audio generated",
                    _ => "Generating audio",
                };
                self.set_status(next, message);
                return;
            }
        }

        let seen = (status, self.session.progress(), self.current_index());
        if self.published != Some(seen) {
            let message = match self.current_index() {
                Some(i) => format!("Reading segment {} of {}", i + 1, self.session.segments().len()),
                None => format!("{:?}", status),
            };
            self.publish(message);
        }
    }

    fn set_status(&mut self, status: SessionStatus, message: impl Into<String>) {
        if self.session.status() != status {
            debug!("Session {:?} -> {:?}", self.session.status(), status);
        }
        self.session.reduce(StateDelta::Status(status));
        self.publish(message.into());
    }

    fn publish(&mut self, message: String) {
        let update = StatusUpdate {
            status: self.session.status(),
            message,
            progress: self.session.progress(),
            current_index: self.current_index(),
        };
        self.published = Some((update.status, update.progress, update.current_index));
        self.emit(PipelineEvent::Status(update));
    }

    fn current_index(&self) -> Option<usize> {
        self.session.playing().map(|id| id.index())
    }

    fn emit(&self, event: PipelineEvent) {
        // Caller dropped the handle; keep running until stop is observed
        let _ = self.events.send(event);
    }
}

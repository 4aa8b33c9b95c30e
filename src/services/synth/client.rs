use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SynthesisRequest, Synthesizer};
use crate::error::SynthesisError;
use crate::kernel::credentials::{CredentialId, CredentialPool};
use crate::kernel::event::{CooldownReason, PipelineEvent, RetryCause};
use crate::kernel::retry::{RetryMachine, RetryPolicy, RetryState};
use crate::kernel::segment::SegmentId;

/// Drives one segment request through the retry machine.
///
/// Every attempt asks the pool for a credential afresh, so a skip or cooldown
/// issued by the operator mid-wait applies to the very next send.
#[derive(Clone)]
pub struct SynthesisClient {
    synthesizer: Arc<dyn Synthesizer>,
    pool: Arc<CredentialPool>,
    policy: RetryPolicy,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl SynthesisClient {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, pool: Arc<CredentialPool>, policy: RetryPolicy) -> Self {
        Self {
            synthesizer,
            pool,
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn synthesize(
        &self,
        segment: SegmentId,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, SynthesisError> {
        let mut machine = RetryMachine::new(self.policy.clone());
        let mut audio = None;
        let mut last_credential: Option<CredentialId> = None;

        loop {
            match machine.state().clone() {
                RetryState::Attempting { attempt } => {
                    if cancel.is_cancelled() {
                        machine.abort(SynthesisError::Cancelled);
                        continue;
                    }

                    // Everything saturated: sit out the window before sending
                    let peek = match self.pool.peek_best() {
                        Ok(peek) => peek,
                        Err(e) => {
                            machine.abort(e.into());
                            continue;
                        }
                    };
                    if !peek.wait_time.is_zero() {
                        info!("{}: all credentials saturated, waiting {:?}", segment, peek.wait_time);
                        if let Err(e) = self
                            .countdown(segment, peek.wait_time, CooldownReason::PoolSaturated, None, cancel)
                            .await
                        {
                            machine.abort(e);
                        }
                        continue;
                    }

                    let selection = match self.pool.select_and_record() {
                        Ok(selection) => selection,
                        Err(e) => {
                            machine.abort(e.into());
                            continue;
                        }
                    };
                    last_credential = Some(selection.credential);
                    debug!("{}: attempt {} via {}", segment, attempt, selection.credential);
                    self.emit(PipelineEvent::RequestSent {
                        segment,
                        credential: selection.credential,
                        attempt,
                    });

                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(SynthesisError::Cancelled),
                        r = self.synthesizer.synthesize(&selection.key, request) => r,
                    };

                    match result {
                        Ok(bytes) => {
                            audio = Some(bytes);
                            machine.on_success();
                        }
                        Err(SynthesisError::Cancelled) => {
                            machine.abort(SynthesisError::Cancelled);
                        }
                        Err(e) => {
                            warn!("{}: attempt {} via {} failed: {}", segment, attempt, selection.credential, e);
                            let cause = match &e {
                                SynthesisError::RateLimited { .. } => Some(RetryCause::RateLimited),
                                SynthesisError::Transient(_) => Some(RetryCause::Transient),
                                _ => None,
                            };
                            let detail = e.to_string();
                            machine.on_failure(e, draw_jitter(self.policy.max_jitter));

                            let delay = match machine.state() {
                                RetryState::Cooldown { wait, .. } => Some(*wait),
                                RetryState::Backoff { delay } => Some(*delay),
                                _ => None,
                            };
                            if let (Some(cause), Some(delay)) = (cause, delay) {
                                self.emit(PipelineEvent::Retrying {
                                    segment,
                                    attempt,
                                    delay,
                                    cause,
                                    detail,
                                });
                            }
                        }
                    }
                }
                RetryState::Cooldown { wait, consecutive_hits } => {
                    warn!("{}: rate limited (hit {}), cooling down {:?}", segment, consecutive_hits, wait);
                    match self
                        .countdown(segment, wait, CooldownReason::RateLimited, last_credential, cancel)
                        .await
                    {
                        Ok(()) => {
                            machine.resume();
                        }
                        Err(e) => {
                            machine.abort(e);
                        }
                    }
                }
                RetryState::Backoff { delay } => {
                    debug!("{}: backing off {:?}", segment, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            machine.abort(SynthesisError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {
                            machine.resume();
                        }
                    }
                }
                RetryState::Succeeded => {
                    return audio.ok_or_else(|| SynthesisError::Transient("empty response".into()));
                }
                RetryState::Failed(e) => {
                    if e != SynthesisError::Cancelled {
                        error!("{}: giving up after {} attempts: {}", segment, machine.attempts(), e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Wait out `total`, reporting progress every `countdown_interval`.
    ///
    /// Ends early once the pool has a usable credential: any credential for a
    /// saturation wait, or one other than `failed` after a rate-limit
    /// rejection (operator swap or skip).
    async fn countdown(
        &self,
        segment: SegmentId,
        total: Duration,
        reason: CooldownReason,
        failed: Option<CredentialId>,
        cancel: &CancellationToken,
    ) -> Result<(), SynthesisError> {
        let Some(deadline) = Instant::now().checked_add(total) else {
            return Err(SynthesisError::Transient(format!("cooldown of {:?} is out of range", total)));
        };
        let mut remaining = total;

        loop {
            self.emit(PipelineEvent::Cooldown {
                segment,
                reason,
                remaining,
                total,
            });

            let tick = remaining.min(self.policy.countdown_interval);
            tokio::select! {
                _ = cancel.cancelled() => return Err(SynthesisError::Cancelled),
                _ = tokio::time::sleep(tick) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            remaining = deadline - now;

            if let Ok(best) = self.pool.peek_best() {
                let usable = best.wait_time.is_zero()
                    && match reason {
                        CooldownReason::PoolSaturated => true,
                        CooldownReason::RateLimited => Some(best.credential) != failed,
                    };
                if usable {
                    info!("{}: {} available, cutting cooldown short ({:?} left)", segment, best.credential, remaining);
                    return Ok(());
                }
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone means the session is being torn down
            let _ = tx.send(event);
        }
    }
}

fn draw_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

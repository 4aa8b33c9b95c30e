use std::time::Duration;

use super::credentials::CredentialId;
use super::segment::SegmentId;
use super::state::SessionStatus;
use super::telemetry::metrics::TelemetrySnapshot;
use crate::error::SynthesisError;

/// Caller -> coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Stop,
    SkipCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    /// Every credential is at its limit for the current window.
    PoolSaturated,
    /// The endpoint rejected the request with a quota error.
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    RateLimited,
    Transient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    pub message: String,
    pub progress: u8, // 0 - 100
    pub current_index: Option<usize>,
}

/// Coordinator -> caller. Also produced by the synthesis client while a
/// request is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Status(StatusUpdate),
    RequestSent {
        segment: SegmentId,
        credential: CredentialId,
        attempt: u32,
    },
    /// Emitted when a wait starts (`remaining == total`) and then on every
    /// countdown tick.
    Cooldown {
        segment: SegmentId,
        reason: CooldownReason,
        remaining: Duration,
        total: Duration,
    },
    Retrying {
        segment: SegmentId,
        attempt: u32,
        delay: Duration,
        cause: RetryCause,
        detail: String,
    },
    SegmentReady {
        segment: SegmentId,
        duration_secs: f64,
    },
    SegmentStarted {
        segment: SegmentId,
        at_secs: f64,
    },
    SegmentEnded {
        segment: SegmentId,
    },
    SegmentFailed {
        segment: SegmentId,
        error: SynthesisError,
    },
    CredentialSkipped {
        credential: CredentialId,
    },
    Summary(TelemetrySnapshot),
}

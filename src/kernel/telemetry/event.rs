use serde::{Deserialize, Serialize};

use crate::kernel::event::CooldownReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEvent {
    RequestSent {
        credential: usize,
    },
    SegmentGenerated {
        segment: usize,
        audio_ms: u64,
    },
    RateLimited,
    TransientFailure,
    Cooldown {
        kind: CooldownKind,
        duration_ms: u64,
    },
    Backoff {
        duration_ms: u64,
    },
    CredentialSkipped {
        credential: usize,
    },
    /// The cursor had fallen behind the clock when a segment was scheduled.
    Underrun {
        gap_ms: u64,
    },
    SegmentFailed {
        segment: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownKind {
    PoolSaturated,
    RateLimited,
}

impl From<CooldownReason> for CooldownKind {
    fn from(reason: CooldownReason) -> Self {
        match reason {
            CooldownReason::PoolSaturated => CooldownKind::PoolSaturated,
            CooldownReason::RateLimited => CooldownKind::RateLimited,
        }
    }
}

use serde::{Deserialize, Serialize};

use super::event::{CooldownKind, TelemetryEvent};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub requests: RequestStats,
    pub waits: WaitStats,
    pub playback: PlaybackStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub sent: u64,
    pub generated: u64,
    pub failed_segments: u64,
    pub rate_limited: u64,
    pub transient_failures: u64,
    pub credential_skips: u64,
    /// Sends per credential index.
    pub per_credential: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitStats {
    pub saturated_cooldowns: u64,
    pub rate_limit_cooldowns: u64,
    /// Sum of the initial countdown of every cooldown (an upper bound; skips cut it short).
    pub cooldown_ms: u64,
    pub backoffs: u64,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub audio_ms: u64,
    pub underruns: u64,
    pub max_underrun_ms: u64,
}

impl TelemetrySnapshot {
    /// Fold one event into the running totals.
    pub fn apply(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::RequestSent { credential } => {
                self.requests.sent += 1;
                if self.requests.per_credential.len() <= *credential {
                    self.requests.per_credential.resize(credential + 1, 0);
                }
                self.requests.per_credential[*credential] += 1;
            }
            TelemetryEvent::SegmentGenerated { audio_ms, .. } => {
                self.requests.generated += 1;
                self.playback.audio_ms += audio_ms;
            }
            TelemetryEvent::RateLimited => self.requests.rate_limited += 1,
            TelemetryEvent::TransientFailure => self.requests.transient_failures += 1,
            TelemetryEvent::Cooldown { kind, duration_ms } => {
                match kind {
                    CooldownKind::PoolSaturated => self.waits.saturated_cooldowns += 1,
                    CooldownKind::RateLimited => self.waits.rate_limit_cooldowns += 1,
                }
                self.waits.cooldown_ms = self.waits.cooldown_ms.saturating_add(*duration_ms);
            }
            TelemetryEvent::Backoff { duration_ms } => {
                self.waits.backoffs += 1;
                self.waits.backoff_ms = self.waits.backoff_ms.saturating_add(*duration_ms);
            }
            TelemetryEvent::CredentialSkipped { .. } => self.requests.credential_skips += 1,
            TelemetryEvent::Underrun { gap_ms } => {
                self.playback.underruns += 1;
                self.playback.max_underrun_ms = self.playback.max_underrun_ms.max(*gap_ms);
            }
            TelemetryEvent::SegmentFailed { .. } => self.requests.failed_segments += 1,
        }
    }
}

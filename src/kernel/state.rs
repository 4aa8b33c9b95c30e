use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::segment::{Segment, SegmentId, SegmentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Idle,
    Preparing,  // Segmenting
    Processing, // Fetching (or about to) ahead of playback
    Playing,    // Generation caught up, only playback outstanding
    Paused,     // Caller paused the clock
    Completed,
    Error,      // A segment failed unrecoverably; waits for resume or stop
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Idle)
    }
}

/// The only way session state mutates.
#[derive(Debug, Clone)]
pub enum StateDelta {
    Segmented(Vec<Segment>),
    Status(SessionStatus),
    FetchStarted(SegmentId),
    AudioReady {
        id: SegmentId,
        samples: Arc<[f32]>,
        duration_secs: f64,
    },
    Scheduled(SegmentId),
    PlaybackStarted(SegmentId),
    PlaybackEnded(SegmentId),
    /// Audio released from memory. `keep` retains it on the segment for export.
    Pruned { id: SegmentId, keep: bool },
    FetchFailed { id: SegmentId, error: String },
    Requeued(SegmentId),
    Reset,
}

#[derive(Debug, Clone)]
pub struct PipelineSession {
    pub id: Uuid,
    segments: Vec<Segment>,
    status: SessionStatus,
    look_ahead: usize,
    playing: Option<SegmentId>,
    // Monotonic, bumped on every reduction
    pub version: u64,
}

impl PipelineSession {
    pub fn new(look_ahead: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            segments: Vec::new(),
            status: SessionStatus::Idle,
            look_ahead,
            playing: None,
            version: 0,
        }
    }

    pub fn reduce(&mut self, delta: StateDelta) {
        self.version += 1;

        match delta {
            StateDelta::Segmented(segments) => {
                self.segments = segments;
                self.playing = None;
            }
            StateDelta::Status(status) => {
                self.status = status;
            }
            StateDelta::FetchStarted(id) => {
                self.advance(id, SegmentStatus::Generating);
            }
            StateDelta::AudioReady {
                id,
                samples,
                duration_secs,
            } => {
                if self.advance(id, SegmentStatus::Ready) {
                    if let Some(seg) = self.segments.get_mut(id.0) {
                        seg.samples = Some(samples);
                        seg.duration_secs = Some(duration_secs);
                        seg.error = None;
                    }
                }
            }
            StateDelta::Scheduled(id) => {
                self.advance(id, SegmentStatus::Scheduled);
            }
            StateDelta::PlaybackStarted(id) => {
                self.playing = Some(id);
            }
            StateDelta::PlaybackEnded(id) => {
                self.advance(id, SegmentStatus::Played);
                if self.playing == Some(id) {
                    self.playing = None;
                }
            }
            StateDelta::Pruned { id, keep } => {
                if !keep {
                    if let Some(seg) = self.segments.get_mut(id.0) {
                        seg.samples = None;
                    }
                }
            }
            StateDelta::FetchFailed { id, error } => {
                if self.advance(id, SegmentStatus::Failed) {
                    if let Some(seg) = self.segments.get_mut(id.0) {
                        seg.error = Some(error);
                    }
                }
            }
            StateDelta::Requeued(id) => {
                // Error message stays until the segment succeeds
                self.advance(id, SegmentStatus::Pending);
            }
            StateDelta::Reset => {
                self.segments.clear();
                self.playing = None;
                self.status = SessionStatus::Idle;
            }
        }
    }

    fn advance(&mut self, id: SegmentId, next: SegmentStatus) -> bool {
        let Some(seg) = self.segments.get_mut(id.0) else {
            warn!("Unknown segment {}", id);
            return false;
        };
        if !seg.status.can_advance_to(&next) {
            warn!("Ignoring {} transition {:?} -> {:?}", id, seg.status, next);
            return false;
        }
        seg.status = next;
        true
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0)
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    pub fn playing(&self) -> Option<SegmentId> {
        self.playing
    }

    /// Index playback is at: the segment sounding now, else the first one
    /// that hasn't finished.
    pub fn playback_position(&self) -> usize {
        if let Some(id) = self.playing {
            return id.0;
        }
        self.segments
            .iter()
            .position(|s| s.status != SegmentStatus::Played)
            .unwrap_or(self.segments.len())
    }

    /// First pending segment inside the look-ahead window.
    pub fn next_fetch(&self) -> Option<SegmentId> {
        let limit = self.playback_position() + self.look_ahead;
        self.segments
            .iter()
            .find(|s| s.is_pending())
            .filter(|s| s.id.0 <= limit)
            .map(|s| s.id)
    }

    /// Next segment to bind to the clock, in text order: the first segment
    /// not yet scheduled, and only if its audio is ready.
    pub fn next_to_schedule(&self) -> Option<SegmentId> {
        self.segments
            .iter()
            .find(|s| !matches!(s.status, SegmentStatus::Scheduled | SegmentStatus::Played))
            .filter(|s| s.status == SegmentStatus::Ready)
            .map(|s| s.id)
    }

    pub fn failed(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .map(|s| s.id)
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.segments.iter().any(|s| s.is_pending())
    }

    pub fn all_played(&self) -> bool {
        self.segments.iter().all(|s| s.status == SegmentStatus::Played)
    }

    /// Share of segments whose audio has been generated, 0 - 100.
    pub fn progress(&self) -> u8 {
        if self.segments.is_empty() {
            return 100;
        }
        let done = self
            .segments
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SegmentStatus::Ready | SegmentStatus::Scheduled | SegmentStatus::Played
                )
            })
            .count();
        ((done * 100) / self.segments.len()) as u8
    }
}

//! Gapless playback scheduling.
//!
//! Placement is decided by the cursor, never by arrival time: each segment
//! starts where the previous one ended, unless the pipeline has fallen behind
//! the clock, in which case it starts a small safety lead from now.
//!
//! Start/end markers are best-effort. They are produced by `poll`, which the
//! coordinator calls on its cadence, so they trail the real boundaries by up
//! to one cadence period. Use them for highlighting, not for sync.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::segment::SegmentId;
use crate::audio::backend::AudioBackend;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub id: SegmentId,
    pub start: f64,
    pub duration: f64,
    /// Silence inserted because the cursor was behind the clock.
    pub gap: f64,
}

impl Placement {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackMarker {
    Started { id: SegmentId, at: f64 },
    Ended { id: SegmentId },
}

#[derive(Debug)]
struct Scheduled {
    placement: Placement,
    started: bool,
    ended: bool,
}

pub struct PlaybackScheduler {
    backend: Box<dyn AudioBackend>,
    sample_rate: u32,
    safety_lead: f64,
    next_start_time: f64,
    buffers: HashMap<SegmentId, Arc<[f32]>>,
    scheduled: BTreeMap<SegmentId, Scheduled>,
    active: bool,
    paused: bool,
}

impl PlaybackScheduler {
    pub fn new(backend: Box<dyn AudioBackend>, sample_rate: u32, safety_lead_secs: f64) -> Self {
        Self {
            backend,
            sample_rate: sample_rate.max(1),
            safety_lead: safety_lead_secs.max(0.0),
            next_start_time: 0.0,
            buffers: HashMap::new(),
            scheduled: BTreeMap::new(),
            active: true,
            paused: false,
        }
    }

    /// Re-arm after `stop`.
    pub fn init(&mut self) {
        self.active = true;
        self.paused = false;
        self.backend.resume();
    }

    pub fn now(&self) -> f64 {
        self.backend.now()
    }

    /// Next free instant on the clock.
    pub fn cursor(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Hold decoded audio until its turn comes.
    pub fn enqueue(&mut self, id: SegmentId, samples: impl Into<Arc<[f32]>>) {
        self.buffers.insert(id, samples.into());
    }

    pub fn is_queued(&self, id: SegmentId) -> bool {
        self.buffers.contains_key(&id) && !self.scheduled.contains_key(&id)
    }

    /// Bind an enqueued segment to the clock. Must be called in playback order.
    pub fn schedule(&mut self, id: SegmentId) -> bool {
        self.schedule_placement(id).is_some()
    }

    pub fn schedule_placement(&mut self, id: SegmentId) -> Option<Placement> {
        if !self.active || self.scheduled.contains_key(&id) {
            return None;
        }
        let samples = self.buffers.get(&id)?.clone();

        let duration = samples.len() as f64 / self.sample_rate as f64;
        let earliest = self.backend.now() + self.safety_lead;
        let (start, gap) = if self.next_start_time >= earliest {
            (self.next_start_time, 0.0)
        } else {
            (earliest, earliest - self.next_start_time)
        };

        if let Err(e) = self.backend.play_at(id, samples, self.sample_rate, start) {
            warn!("Failed to hand {} to the output: {}", id, e);
            return None;
        }

        let placement = Placement {
            id,
            start,
            duration,
            gap,
        };
        debug!("{} scheduled at {:.3}s for {:.3}s", id, start, duration);
        self.next_start_time = start + duration;
        self.scheduled.insert(
            id,
            Scheduled {
                placement,
                started: false,
                ended: false,
            },
        );
        Some(placement)
    }

    pub fn placement(&self, id: SegmentId) -> Option<Placement> {
        self.scheduled.get(&id).map(|s| s.placement)
    }

    /// Markers for every boundary the clock has passed since the last poll.
    pub fn poll(&mut self) -> Vec<PlaybackMarker> {
        let now = self.backend.now();
        let mut markers = Vec::new();

        for (id, entry) in self.scheduled.iter_mut() {
            if !entry.started && now >= entry.placement.start {
                entry.started = true;
                markers.push(PlaybackMarker::Started {
                    id: *id,
                    at: entry.placement.start,
                });
            }
            if entry.started && !entry.ended && now >= entry.placement.end() {
                entry.ended = true;
                markers.push(PlaybackMarker::Ended { id: *id });
            }
        }

        markers
    }

    /// Release audio of segments that finished playing.
    pub fn prune(&mut self, ids: &[SegmentId]) {
        for id in ids {
            let finished = self.scheduled.get(id).map_or(false, |s| s.ended);
            if finished {
                self.scheduled.remove(id);
                self.buffers.remove(id);
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffers.len()
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.backend.suspend();
    }

    pub fn resume(&mut self) {
        self.active = true;
        self.paused = false;
        self.backend.resume();
    }

    /// Hard stop: everything pending is dropped and the cursor goes back to
    /// zero. Inert until `init` or `resume`.
    pub fn stop(&mut self) {
        self.backend.clear();
        self.buffers.clear();
        self.scheduled.clear();
        self.next_start_time = 0.0;
        self.active = false;
    }
}

use std::sync::Arc;
use tokio::time::Instant;

use crate::error::AudioError;
use crate::kernel::segment::SegmentId;

/// An audio clock plus a sink that can start buffers at given clock times.
///
/// The clock keeps running while the pipeline waits on the network; it only
/// stops when `suspend` is called.
pub trait AudioBackend: Send {
    /// Seconds on the playback clock.
    fn now(&self) -> f64;

    fn play_at(&mut self, id: SegmentId, samples: Arc<[f32]>, sample_rate: u32, start_secs: f64) -> Result<(), AudioError>;

    fn suspend(&mut self);

    fn resume(&mut self);

    /// Drop everything pending or currently sounding.
    fn clear(&mut self);
}

/// Deviceless backend: the clock is wall time (tokio's, so it can be paused
/// in tests) and buffers are never sounded.
#[derive(Debug)]
pub struct VirtualBackend {
    elapsed: f64,
    running_since: Option<Instant>,
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self {
            elapsed: 0.0,
            running_since: Some(Instant::now()),
        }
    }
}

impl AudioBackend for VirtualBackend {
    fn now(&self) -> f64 {
        match self.running_since {
            Some(since) => self.elapsed + since.elapsed().as_secs_f64(),
            None => self.elapsed,
        }
    }

    fn play_at(&mut self, _id: SegmentId, _samples: Arc<[f32]>, _sample_rate: u32, _start_secs: f64) -> Result<(), AudioError> {
        Ok(())
    }

    fn suspend(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += since.elapsed().as_secs_f64();
        }
    }

    fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn clear(&mut self) {}
}

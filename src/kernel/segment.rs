use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Position of a segment in the original text. Fixed at segmentation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub usize);

impl SegmentId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Generating, // Request in flight (including cooldown/backoff waits)
    Ready,      // Audio decoded, waiting for its turn on the clock
    Scheduled,  // Bound to a start time on the audio clock
    Played,
    Failed,
}

impl SegmentStatus {
    fn rank(&self) -> u8 {
        match self {
            SegmentStatus::Pending => 0,
            SegmentStatus::Generating => 1,
            SegmentStatus::Failed => 1,
            SegmentStatus::Ready => 2,
            SegmentStatus::Scheduled => 3,
            SegmentStatus::Played => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    /// `Failed -> Pending` is the single sanctioned step backwards (explicit retry).
    pub fn can_advance_to(&self, next: &SegmentStatus) -> bool {
        match (self, next) {
            (SegmentStatus::Failed, SegmentStatus::Pending) => true,
            (SegmentStatus::Generating, SegmentStatus::Failed) => true,
            (SegmentStatus::Pending, SegmentStatus::Failed) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub text: String,
    pub status: SegmentStatus,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
    #[serde(skip)]
    pub samples: Option<Arc<[f32]>>, // Dropped once played and pruned
}

impl Segment {
    pub fn new(id: SegmentId, text: String) -> Self {
        Self {
            id,
            text,
            status: SegmentStatus::Pending,
            duration_secs: None,
            error: None,
            samples: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == SegmentStatus::Pending
    }
}

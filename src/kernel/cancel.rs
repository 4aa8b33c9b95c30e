use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::segment::SegmentId;

struct InFlight {
    id: SegmentId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the session-wide cancellation token and the single fetch task
/// allowed to run at a time.
pub struct CancellationRegistry {
    session: CancellationToken,
    inflight: Option<InFlight>,
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            session: CancellationToken::new(),
            inflight: None,
        }
    }

    /// Token for a new fetch. Cancelled with the session, or on its own via
    /// `cancel_inflight`.
    pub fn child_token(&self) -> CancellationToken {
        self.session.child_token()
    }

    pub fn register(&mut self, id: SegmentId, token: CancellationToken, task: JoinHandle<()>) {
        if let Some(previous) = self.inflight.replace(InFlight { id, token, task }) {
            debug!("Replacing in-flight fetch for {}", previous.id);
            previous.token.cancel();
            previous.task.abort();
        }
    }

    pub fn has_inflight(&self) -> bool {
        self.inflight.is_some()
    }

    /// Clear the slot if `id` is the fetch being tracked. A `false` return
    /// means the result is stale and should be dropped.
    pub fn complete(&mut self, id: SegmentId) -> bool {
        match &self.inflight {
            Some(f) if f.id == id => {
                self.inflight = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_inflight(&mut self) {
        if let Some(f) = self.inflight.take() {
            debug!("Abandoning fetch for {}", f.id);
            f.token.cancel();
            f.task.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        self.session.cancel();
        self.cancel_inflight();
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }
}

impl Drop for CancellationRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

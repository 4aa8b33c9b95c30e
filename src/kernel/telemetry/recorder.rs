use super::event::TelemetryEvent;
use super::metrics::TelemetrySnapshot;

/// Keeps running totals only, so a session of any length reports exact
/// counts.
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    totals: TelemetrySnapshot,
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: TelemetryEvent) {
        self.totals.apply(&event);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.totals.clone()
    }
}

use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

const MIN_CADENCE: Duration = Duration::from_millis(1);

/// Driver cadence. Late ticks are skipped rather than bunched up.
pub fn cadence(period: Duration) -> Interval {
    let mut ticker = interval(period.max(MIN_CADENCE));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Clock seconds -> whole milliseconds, for telemetry.
pub fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

//! Session telemetry.
//!
//! Telemetry is a read-only side channel: nothing in the pipeline reads it
//! back to make decisions. Events carry ids, durations and counts only; never
//! segment text, audio, or credential tokens.

pub mod event;
pub mod metrics;
pub mod recorder;

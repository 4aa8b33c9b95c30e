//! Retry/backoff state machine for a single segment request.
//!
//! Pure: the machine never sleeps or draws randomness itself. The synthesis
//! client feeds it attempt outcomes (plus a jitter sample) and performs the
//! waits it asks for.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::SynthesisError;

static RETRY_DELAY_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?retryDelay"?\s*[:=]\s*"?([0-9]+(?:\.[0-9]+)?)s"#).expect("retryDelay pattern")
});
static RETRY_IN_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)retry\s+(?:in|after)\s+([0-9]+(?:\.[0-9]+)?)\s*(milliseconds?|msecs?|ms|seconds?|secs?|s)\b",
    )
    .expect("retry-in pattern")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_rate_limit_retries: u32,
    pub rate_limit_floor: Duration,
    pub rate_limit_pad: Duration,
    pub rate_limit_pad_pct: f64,
    pub max_suggested_wait: Duration,
    pub max_jitter: Duration,
    pub countdown_interval: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            backoff_base: Duration::from_millis(c.backoff_base_ms),
            max_rate_limit_retries: c.max_rate_limit_retries,
            rate_limit_floor: Duration::from_millis(c.rate_limit_floor_ms),
            rate_limit_pad: Duration::from_millis(c.rate_limit_pad_ms),
            rate_limit_pad_pct: c.rate_limit_pad_pct,
            max_suggested_wait: Duration::from_millis(c.max_suggested_wait_ms),
            max_jitter: Duration::from_millis(c.max_jitter_ms),
            countdown_interval: Duration::from_millis(c.countdown_interval_ms.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// `base * 2^n` where `n` counts transient failures already seen (0-based).
    pub fn backoff_delay(&self, n: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << n.min(16))
    }

    /// Cooldown after a rate-limit rejection.
    ///
    /// `suggested + pad + suggested * pct + jitter`, doubled from the second
    /// consecutive hit onwards. The suggestion is capped at
    /// `max_suggested_wait`.
    pub fn rate_limit_wait(&self, suggested: Option<Duration>, consecutive_hits: u32, jitter: Duration) -> Duration {
        let base = suggested
            .unwrap_or(self.rate_limit_floor)
            .min(self.max_suggested_wait);
        let pct = Duration::try_from_secs_f64(base.as_secs_f64() * self.rate_limit_pad_pct.max(0.0))
            .unwrap_or(Duration::MAX);
        let wait = base
            .saturating_add(self.rate_limit_pad)
            .saturating_add(pct)
            .saturating_add(jitter);
        if consecutive_hits >= 2 {
            wait.saturating_mul(2)
        } else {
            wait
        }
    }
}

/// Extract a server-suggested wait from a rate-limit failure message.
/// Values too large for a `Duration` count as no suggestion.
pub fn parse_suggested_wait(detail: &str) -> Option<Duration> {
    if let Some(caps) = RETRY_DELAY_FIELD.captures(detail) {
        let secs: f64 = caps[1].parse().ok()?;
        return Duration::try_from_secs_f64(secs).ok();
    }

    let caps = RETRY_IN_PHRASE.captures(detail)?;
    let value: f64 = caps[1].parse().ok()?;
    let unit = caps[2].to_ascii_lowercase();
    let secs = if unit.starts_with('m') { value / 1000.0 } else { value };
    Duration::try_from_secs_f64(secs).ok()
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Cooldown { wait: Duration, consecutive_hits: u32 },
    Backoff { delay: Duration },
    Succeeded,
    Failed(SynthesisError),
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded | RetryState::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
    attempts: u32,
    transient_failures: u32,
    consecutive_rate_limits: u32,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 1 },
            attempts: 0,
            transient_failures: 0,
            consecutive_rate_limits: 0,
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Requests actually sent so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits
    }

    pub fn on_success(&mut self) -> &RetryState {
        self.attempts += 1;
        self.state = RetryState::Succeeded;
        &self.state
    }

    /// Outcome of a sent attempt that failed.
    pub fn on_failure(&mut self, err: SynthesisError, jitter: Duration) -> &RetryState {
        self.attempts += 1;
        self.state = self.classify(err, jitter);
        &self.state
    }

    /// Failure that happened before anything was sent (no credentials,
    /// cancellation). Doesn't consume an attempt.
    pub fn abort(&mut self, err: SynthesisError) -> &RetryState {
        self.state = RetryState::Failed(err);
        &self.state
    }

    /// Cooldown or backoff finished; go again.
    pub fn resume(&mut self) -> &RetryState {
        if matches!(self.state, RetryState::Cooldown { .. } | RetryState::Backoff { .. }) {
            self.state = RetryState::Attempting {
                attempt: self.attempts + 1,
            };
        }
        &self.state
    }

    fn classify(&mut self, err: SynthesisError, jitter: Duration) -> RetryState {
        match err {
            SynthesisError::RateLimited { detail, retry_after } => {
                self.consecutive_rate_limits += 1;
                if self.consecutive_rate_limits > self.policy.max_rate_limit_retries {
                    return RetryState::Failed(SynthesisError::ExhaustedRetries {
                        attempts: self.attempts,
                        last: detail,
                    });
                }
                let suggested = retry_after.or_else(|| parse_suggested_wait(&detail));
                let jitter = jitter.min(self.policy.max_jitter);
                RetryState::Cooldown {
                    wait: self
                        .policy
                        .rate_limit_wait(suggested, self.consecutive_rate_limits, jitter),
                    consecutive_hits: self.consecutive_rate_limits,
                }
            }
            SynthesisError::Transient(msg) => {
                self.consecutive_rate_limits = 0;
                self.transient_failures += 1;
                if self.transient_failures >= self.policy.max_attempts {
                    return RetryState::Failed(SynthesisError::ExhaustedRetries {
                        attempts: self.attempts,
                        last: msg,
                    });
                }
                RetryState::Backoff {
                    delay: self.policy.backoff_delay(self.transient_failures - 1),
                }
            }
            other => RetryState::Failed(other),
        }
    }
}

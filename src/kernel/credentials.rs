//! Credential pool with per-credential sliding-window rate limiting.
//!
//! Ledgers hold the send times of the last `window` worth of requests and are
//! purged lazily whenever the pool is read. Time comes from
//! `tokio::time::Instant` so tests can drive it with a paused runtime.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RateLimitConfig;
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CredentialId(pub usize);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// Authorization token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub credential: CredentialId,
    pub key: ApiKey,
    pub wait_time: Duration,
    pub load: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CredentialStatus {
    pub credential: CredentialId,
    pub load: usize,
    pub wait_time: Duration,
}

#[derive(Debug)]
struct Credential {
    key: ApiKey,
    ledger: VecDeque<Instant>,
}

#[derive(Debug)]
pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    limit: usize,
    window: Duration,
    safety_margin: Duration,
}

impl CredentialPool {
    pub fn new<I, S>(keys: I, config: &RateLimitConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials: Vec<Credential> = keys
            .into_iter()
            .map(|k| Credential {
                key: ApiKey::new(k),
                ledger: VecDeque::new(),
            })
            .collect();
        info!(
            "Credential pool: {} keys, {} req / {}ms",
            credentials.len(),
            config.limit,
            config.window_ms
        );

        Self {
            credentials: Mutex::new(credentials),
            limit: config.limit.max(1),
            window: config.window(),
            safety_margin: config.safety_margin(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Best credential for the next request, without recording any usage.
    ///
    /// Ordered by wait time, then load, then configuration order. An error
    /// means nothing is configured; "everything busy" is a selection with a
    /// non-zero `wait_time`.
    pub fn peek_best(&self) -> Result<Selection, PoolError> {
        let now = Instant::now();
        let mut creds = self.lock();
        self.best_locked(&mut creds, now)
    }

    /// Pick the best credential and record one use against it.
    /// Call exactly once per request actually sent.
    pub fn select_and_record(&self) -> Result<Selection, PoolError> {
        let now = Instant::now();
        let mut creds = self.lock();
        let selection = self.best_locked(&mut creds, now)?;
        creds[selection.credential.0].ledger.push_back(now);
        debug!("Selected {} (load {})", selection.credential, selection.load + 1);
        Ok(selection)
    }

    pub fn record_use(&self, id: CredentialId) -> Result<(), PoolError> {
        let now = Instant::now();
        let mut creds = self.lock();
        let cred = creds.get_mut(id.0).ok_or(PoolError::UnknownCredential(id.0))?;
        cred.ledger.push_back(now);
        Ok(())
    }

    /// Fill the ledger up to the limit so the credential is skipped until its
    /// window rolls over.
    pub fn force_cooldown(&self, id: CredentialId) -> Result<(), PoolError> {
        let now = Instant::now();
        let mut creds = self.lock();
        let window = self.window;
        let cred = creds.get_mut(id.0).ok_or(PoolError::UnknownCredential(id.0))?;
        purge(&mut cred.ledger, now, window);
        while cred.ledger.len() < self.limit {
            cred.ledger.push_back(now);
        }
        info!("{} forced into cooldown", id);
        Ok(())
    }

    pub fn status(&self) -> Vec<CredentialStatus> {
        let now = Instant::now();
        let mut creds = self.lock();
        creds
            .iter_mut()
            .enumerate()
            .map(|(i, cred)| {
                purge(&mut cred.ledger, now, self.window);
                CredentialStatus {
                    credential: CredentialId(i),
                    load: cred.ledger.len(),
                    wait_time: self.wait_for(&cred.ledger, now),
                }
            })
            .collect()
    }

    fn best_locked(&self, creds: &mut [Credential], now: Instant) -> Result<Selection, PoolError> {
        let mut best: Option<(usize, Duration, usize)> = None;

        for (i, cred) in creds.iter_mut().enumerate() {
            purge(&mut cred.ledger, now, self.window);
            let load = cred.ledger.len();
            let wait = self.wait_for(&cred.ledger, now);

            let better = match best {
                None => true,
                Some((_, best_wait, best_load)) => (wait, load) < (best_wait, best_load),
            };
            if better {
                best = Some((i, wait, load));
            }
        }

        let (i, wait_time, load) = best.ok_or(PoolError::NoCredentials)?;
        Ok(Selection {
            credential: CredentialId(i),
            key: creds[i].key.clone(),
            wait_time,
            load,
        })
    }

    fn wait_for(&self, ledger: &VecDeque<Instant>, now: Instant) -> Duration {
        if ledger.len() < self.limit {
            return Duration::ZERO;
        }
        match ledger.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now) + self.safety_margin,
            None => Duration::ZERO,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Credential>> {
        // Ledgers are only mutated whole; a poisoned lock is still consistent
        self.credentials.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn purge(ledger: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(ts) = ledger.front() {
        if now.saturating_duration_since(*ts) >= window {
            ledger.pop_front();
        } else {
            break;
        }
    }
}

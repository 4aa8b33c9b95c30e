#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use narrator::config::NarratorConfig;
use narrator::kernel::credentials::ApiKey;
use narrator::{SynthesisError, SynthesisRequest, Synthesizer};

pub const RATE: u32 = 24_000;

/// Little-endian PCM16 silence of the given length.
pub fn pcm(secs: f64) -> Vec<u8> {
    let samples = (secs * RATE as f64).round() as usize;
    vec![0u8; samples * 2]
}

/// Plays back a queue of canned outcomes, then succeeds with `fallback_secs`
/// of audio forever.
pub struct ScriptedSynthesizer {
    script: Mutex<VecDeque<Result<Vec<u8>, SynthesisError>>>,
    fallback_secs: f64,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, SynthesisRequest)>>,
}

impl ScriptedSynthesizer {
    pub fn new(fallback_secs: f64) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback_secs,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, outcome: Result<Vec<u8>, SynthesisError>) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (key, request) for every call, in order.
    pub fn seen(&self) -> Vec<(String, SynthesisRequest)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, key: &ApiKey, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((key.expose().to_string(), request.clone()));
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(pcm(self.fallback_secs)))
    }
}

/// Defaults with randomness and padding stripped out of the retry policy.
pub fn quiet_config(keys: &[&str]) -> NarratorConfig {
    let mut config = NarratorConfig::default();
    config.endpoint.api_keys = keys.iter().map(|k| k.to_string()).collect();
    config.retry.max_jitter_ms = 0;
    config.retry.rate_limit_pad_ms = 0;
    config.retry.rate_limit_pad_pct = 0.0;
    config.retry.backoff_base_ms = 100;
    config.rate_limit.safety_margin_ms = 100;
    config
}

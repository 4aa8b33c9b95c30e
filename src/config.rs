use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_API_KEYS: &str = "NARRATOR_API_KEYS";
pub const ENV_ENDPOINT: &str = "NARRATOR_ENDPOINT";
pub const ENV_MODEL: &str = "NARRATOR_MODEL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    pub segmenter: SegmenterConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub playback: PlaybackConfig,
    pub pipeline: PipelineConfig,
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Upper bound on characters per request.
    pub max_length: usize,
    /// Characters of the previous segment sent along as context. 0 disables.
    pub context_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_length: 1500,
            context_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per credential inside one window.
    pub limit: usize,
    pub window_ms: u64,
    /// Added on top of the computed wait so we never retry right on the edge.
    pub safety_margin_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 9,
            window_ms: 60_000,
            safety_margin_ms: 500,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts allowed for transient failures (the first send included).
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Consecutive rate-limit rejections tolerated before giving up.
    pub max_rate_limit_retries: u32,
    /// Wait used when a rate-limit rejection carries no suggestion.
    pub rate_limit_floor_ms: u64,
    pub rate_limit_pad_ms: u64,
    /// Fraction of the suggested wait added on top (0.2 = 20%).
    pub rate_limit_pad_pct: f64,
    /// Ceiling on a server-suggested wait before padding.
    pub max_suggested_wait_ms: u64,
    pub max_jitter_ms: u64,
    /// How often cooldown progress is reported.
    pub countdown_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            max_rate_limit_retries: 8,
            rate_limit_floor_ms: 10_000,
            rate_limit_pad_ms: 2_000,
            rate_limit_pad_pct: 0.2,
            max_suggested_wait_ms: 300_000,
            max_jitter_ms: 1_000,
            countdown_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Rate of the PCM returned by the endpoint.
    pub sample_rate: u32,
    /// Lead added when the cursor has fallen behind the clock.
    pub safety_lead_ms: u64,
    /// Coordinator cadence; also the resolution of start/end markers.
    pub cadence_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            safety_lead_ms: 50,
            cadence_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many segments may be fetched ahead of the one playing.
    pub look_ahead: usize,
    /// Keep decoded audio after playback so the session can be exported.
    pub retain_audio: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            look_ahead: 3,
            retain_audio: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub api_keys: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash-preview-tts".to_string(),
            timeout_secs: 60,
            api_keys: Vec::new(),
        }
    }
}

impl NarratorConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// `lookup` is injected so tests don't have to touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(keys) = lookup(ENV_API_KEYS) {
            let keys: Vec<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            if !keys.is_empty() {
                self.endpoint.api_keys = keys;
            }
        }
        if let Some(url) = lookup(ENV_ENDPOINT) {
            self.endpoint.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.endpoint.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segmenter.max_length == 0 {
            return Err(ConfigError::Invalid("segmenter.max_length must be > 0".into()));
        }
        if self.rate_limit.limit == 0 {
            return Err(ConfigError::Invalid("rate_limit.limit must be > 0".into()));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.playback.sample_rate == 0 {
            return Err(ConfigError::Invalid("playback.sample_rate must be > 0".into()));
        }
        if self.playback.cadence_ms == 0 {
            return Err(ConfigError::Invalid("playback.cadence_ms must be > 0".into()));
        }
        if !(0.0..=10.0).contains(&self.retry.rate_limit_pad_pct) {
            return Err(ConfigError::Invalid("retry.rate_limit_pad_pct out of range".into()));
        }
        Ok(())
    }
}

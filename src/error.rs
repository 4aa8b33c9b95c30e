use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy of a synthesis request.
///
/// `RateLimited` and `Transient` are attempt-level classifications: the
/// synthesis client retries them internally and only ever returns
/// `ExhaustedRetries` once its policy gives up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SynthesisError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after: Option<Duration>, // From a transport header, if any
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: String },

    #[error("no credentials configured")]
    NoCredentialsAvailable,

    #[error("cancelled")]
    Cancelled,
}

impl SynthesisError {
    pub fn rate_limited(detail: impl Into<String>) -> Self {
        SynthesisError::RateLimited {
            detail: detail.into(),
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no credentials configured")]
    NoCredentials,
    #[error("unknown credential key#{0}")]
    UnknownCredential(usize),
}

impl From<PoolError> for SynthesisError {
    fn from(_: PoolError) -> Self {
        SynthesisError::NoCredentialsAvailable
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("payload is not 16-bit PCM ({0} bytes)")]
    OddPayload(usize),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

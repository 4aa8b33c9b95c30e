pub mod client;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SynthesisError;
use crate::kernel::credentials::ApiKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice: String,
    /// Free-form delivery instruction ("calm, unhurried narration").
    pub style: Option<String>,
    /// Language directive, e.g. "en-US".
    pub language: Option<String>,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: "Kore".to_string(),
            style: None,
            language: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: VoiceParams,
    /// Tail of the previous segment, for prosodic continuity. Not spoken.
    pub context: Option<String>,
}

/// The remote speech endpoint: one request in, encoded audio out.
///
/// Implementations classify failures into `Auth`, `InvalidRequest`,
/// `RateLimited` or `Transient`; retrying is the caller's business.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, key: &ApiKey, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError>;
}

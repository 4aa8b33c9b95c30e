use async_trait::async_trait;
use base64::Engine;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{SynthesisRequest, Synthesizer};
use crate::config::EndpointConfig;
use crate::error::SynthesisError;
use crate::kernel::credentials::ApiKey;

/// `generateContent` speech endpoint (JSON in, base64 16-bit PCM out).
#[derive(Clone)]
pub struct HttpSynthesizer {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs.max(1)))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, key: &ApiKey, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        let body = build_request(request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(classify_status(status, &body, retry_after));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| SynthesisError::Transient(format!("failed to read response: {e}")))?;
        let audio = extract_audio(&raw)?;
        debug!("Received {} bytes of PCM", audio.len());
        Ok(audio)
    }
}

/// Prompt sent to the model: delivery instruction, optional continuity
/// context, then the passage itself.
pub fn compose_prompt(request: &SynthesisRequest) -> String {
    let mut prompt = String::new();
    if let Some(style) = request.voice.style.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(style.trim());
        prompt.push_str("\n\n");
    }
    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str("[Previous passage, for continuity only. Do not read it aloud: \"");
        prompt.push_str(context.trim());
        prompt.push_str("\"]\n\n");
    }
    prompt.push_str(&request.text);
    prompt
}

fn build_request(request: &SynthesisRequest) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: Some(compose_prompt(request)),
                inline_data: None,
            }],
        }],
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: request.voice.voice.clone(),
                    },
                },
                language_code: request.voice.language.clone(),
            },
        },
    }
}

/// Map a non-success HTTP response onto the failure taxonomy.
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> SynthesisError {
    let detail = format!("{} {}", status.as_u16(), body.trim());
    match status.as_u16() {
        401 | 403 => SynthesisError::Auth(detail),
        // Bad keys come back as 400 INVALID_ARGUMENT
        400 if body.contains("API_KEY_INVALID") || body.contains("API key not valid") => SynthesisError::Auth(detail),
        429 => SynthesisError::RateLimited { detail, retry_after },
        408 | 500..=599 => SynthesisError::Transient(detail),
        _ => SynthesisError::InvalidRequest(detail),
    }
}

/// Pull the PCM payload out of a successful response body.
pub fn extract_audio(raw: &str) -> Result<Vec<u8>, SynthesisError> {
    let parsed: GenerateResponse = serde_json::from_str(raw)
        .map_err(|e| SynthesisError::Transient(format!("malformed response: {e}")))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(SynthesisError::InvalidRequest(format!("prompt blocked: {reason}")));
    }

    let mut finish = None;
    for candidate in parsed.candidates {
        finish = candidate.finish_reason.or(finish);
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for part in parts {
            if let Some(inline) = part.inline_data {
                return base64::engine::general_purpose::STANDARD
                    .decode(inline.data.as_bytes())
                    .map_err(|e| SynthesisError::Transient(format!("bad base64 audio: {e}")));
            }
        }
    }

    // The model occasionally answers without audio; a resend usually works
    Err(SynthesisError::Transient(format!(
        "response contained no audio (finish reason: {})",
        finish.as_deref().unwrap_or("unknown")
    )))
}

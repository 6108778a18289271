use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";

/// Finish reasons the provider uses when a candidate was withheld for safety.
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

#[derive(Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for InlineImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    pub candidate_count: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            top_p: 0.8,
            max_output_tokens: 8192,
            candidate_count: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub instruction: String,
    pub subject: InlineImage,
    pub garment: InlineImage,
    pub garment_label: String,
    pub params: GenerationParams,
}

/// What the provider sent back, before classification.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub block_reason: Option<String>,
    pub images: Vec<InlineImage>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCallError {
    /// Network failure, timeout, throttling or a server-side error.
    Transport(String),
    /// The provider refused the call outright; repeating it will not help.
    Rejected(String),
}

impl std::fmt::Display for ProviderCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderCallError::Transport(message) => write!(f, "transport: {message}"),
            ProviderCallError::Rejected(message) => write!(f, "rejected: {message}"),
        }
    }
}

/// The external image-generation boundary.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate_content(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderCallError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// `generateContent` client for Gemini image models.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build provider http client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl ImageProvider for GeminiProvider {
    async fn generate_content(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderCallError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request_body(request))
            .send()
            .await
            .map_err(|err| ProviderCallError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderCallError::Transport(err.to_string()))?;
        debug!(%status, body_len = body.len(), "provider responded");
        if !status.is_success() {
            let message = format!("HTTP {status}: {body}");
            return Err(if is_transient_status(status) {
                ProviderCallError::Transport(message)
            } else {
                ProviderCallError::Rejected(message)
            });
        }
        parse_response(&body).map_err(|err| ProviderCallError::Rejected(format!("{err:#}")))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_request_body(request: &ProviderRequest) -> serde_json::Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                {"text": request.instruction},
                {"text": "Person photo:"},
                {"inline_data": {
                    "mime_type": request.subject.mime_type,
                    "data": STANDARD.encode(&request.subject.data),
                }},
                {"text": format!("Garment: {}", request.garment_label)},
                {"inline_data": {
                    "mime_type": request.garment.mime_type,
                    "data": STANDARD.encode(&request.garment.data),
                }},
            ],
        }],
        "generationConfig": {
            "temperature": request.params.temperature,
            "topP": request.params.top_p,
            "maxOutputTokens": request.params.max_output_tokens,
            "candidateCount": request.params.candidate_count,
            "responseModalities": ["IMAGE", "TEXT"],
        },
    })
}

fn parse_response(body: &str) -> Result<ProviderResponse> {
    let payload: GenerateContentResponse =
        serde_json::from_str(body).context("decode provider response")?;

    let mut parsed = ProviderResponse {
        block_reason: payload.prompt_feedback.and_then(|feedback| feedback.block_reason),
        ..ProviderResponse::default()
    };
    let mut texts = Vec::new();
    for candidate in payload.candidates.unwrap_or_default() {
        if parsed.block_reason.is_none() {
            if let Some(reason) = candidate
                .finish_reason
                .as_deref()
                .filter(|reason| SAFETY_FINISH_REASONS.contains(reason))
            {
                parsed.block_reason = Some(reason.to_string());
            }
        }
        let parts = candidate
            .content
            .and_then(|content| content.parts)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.text.filter(|text| !text.trim().is_empty()) {
                texts.push(text);
            }
            if let Some(InlineData {
                mime_type,
                data: Some(data),
            }) = part.inline_data
            {
                let data = STANDARD.decode(data.trim()).context("decode inline image")?;
                if !data.is_empty() {
                    parsed.images.push(InlineImage {
                        mime_type: mime_type.unwrap_or_else(|| "image/png".to_string()),
                        data,
                    });
                }
            }
        }
    }
    if !texts.is_empty() {
        parsed.text = Some(texts.join("\n"));
    }
    Ok(parsed)
}

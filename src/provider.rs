//! Vision model clients: one trait, two HTTP backends.
//!
//! Every model interaction in the pipeline — generation, judging, analysis,
//! verification — goes through [`VisionModel`]. The trait is deliberately
//! small: a request is an ordered list of text and image parts, a reply is
//! the model's text. Prompt engineering lives in [`crate::prompts`]; retry
//! and error classification live here so callers never see a raw 429.
//!
//! ## Retry strategy
//!
//! HTTP 429 / 5xx errors are transient and frequent under load. Exponential
//! backoff (`backoff_ms * 2^attempt`) avoids thundering-herd: with 500 ms
//! base and 3 retries the wait sequence is 500 ms → 1 s → 2 s. Permanent
//! errors (bad key, 400) are not retried and surface immediately.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Pdf2HtmlError;

/// Default Gemini model when none is configured.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
/// Default OpenAI model when none is configured.
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// A base64-encoded image attached to a model request.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub mime_type: String,
    pub data_b64: String,
}

impl ImagePart {
    pub fn png(data_b64: impl Into<String>) -> Self {
        Self {
            mime_type: "image/png".into(),
            data_b64: data_b64.into(),
        }
    }

    /// `data:<mime>;base64,<data>` form used by OpenAI-style APIs.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_b64)
    }
}

/// One element of a multimodal request, in the order the model sees it.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    Image(ImagePart),
}

/// A complete request to a vision model.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub parts: Vec<Part>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl VisionRequest {
    pub fn new(parts: Vec<Part>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            parts,
            temperature,
            max_tokens,
        }
    }
}

/// Errors from a single model call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure (connect, DNS, broken pipe).
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 429 — back off and retry.
    #[error("rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Non-2xx API response.
    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    /// HTTP 401/403 — retrying will not help.
    #[error("authentication rejected by {provider}: {detail}")]
    Auth { provider: String, detail: String },

    /// The call exceeded the configured timeout.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// 2xx response that carried no usable text.
    #[error("{provider} returned an empty reply")]
    EmptyReply { provider: String },
}

impl ProviderError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::Timeout { .. } => true,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Auth { .. } | ProviderError::EmptyReply { .. } => false,
        }
    }
}

/// A vision-capable model endpoint.
///
/// Implementations are logically stateless (HTTP) and safe to share across
/// concurrent judge calls behind an `Arc`.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Short identifier used in logs and `judges_used` lists.
    fn name(&self) -> &str;

    /// Send the request and return the model's text reply.
    async fn generate(&self, request: &VisionRequest) -> Result<String, ProviderError>;
}

/// Call a model, retrying transient failures with exponential backoff.
pub async fn call_with_retry(
    model: &Arc<dyn VisionModel>,
    request: &VisionRequest,
    retries: u32,
    backoff_ms: u64,
) -> Result<String, ProviderError> {
    let mut last_err = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            let backoff = backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                model.name(),
                attempt,
                retries,
                backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }
        match model.generate(request).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_transient() => {
                warn!("{}: transient failure — {}", model.name(), e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(ProviderError::EmptyReply {
        provider: model.name().to_string(),
    }))
}

// ── Gemini ───────────────────────────────────────────────────────────────

/// Google Gemini `generateContent` client.
pub struct GeminiModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    name: String,
}

impl GeminiModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout_secs: u64) -> Self {
        let model = model.into();
        Self {
            client: http_client(timeout_secs),
            api_key: api_key.into(),
            name: format!("gemini:{model}"),
            model,
        }
    }

    fn body(&self, request: &VisionRequest) -> Value {
        let parts: Vec<Value> = request
            .parts
            .iter()
            .map(|p| match p {
                Part::Text(t) => json!({ "text": t }),
                Part::Image(img) => json!({
                    "inlineData": { "mimeType": img.mime_type, "data": img.data_b64 }
                }),
            })
            .collect();
        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            }
        })
    }
}

#[async_trait]
impl VisionModel for GeminiModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &VisionRequest) -> Result<String, ProviderError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| classify_transport("gemini", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("gemini", status, response).await);
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let text = value["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::EmptyReply {
                provider: self.name.clone(),
            });
        }
        debug!("{}: {} chars", self.name, text.len());
        Ok(text)
    }
}

// ── OpenAI ───────────────────────────────────────────────────────────────

/// OpenAI chat-completions client.
pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    name: String,
}

impl OpenAiModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout_secs: u64) -> Self {
        let model = model.into();
        Self {
            client: http_client(timeout_secs),
            api_key: api_key.into(),
            name: format!("openai:{model}"),
            model,
        }
    }

    fn body(&self, request: &VisionRequest) -> Value {
        let content: Vec<Value> = request
            .parts
            .iter()
            .map(|p| match p {
                Part::Text(t) => json!({ "type": "text", "text": t }),
                Part::Image(img) => json!({
                    "type": "image_url",
                    "image_url": { "url": img.data_uri() }
                }),
            })
            .collect();
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

#[async_trait]
impl VisionModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &VisionRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| classify_transport("openai", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("openai", status, response).await);
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if text.trim().is_empty() {
            return Err(ProviderError::EmptyReply {
                provider: self.name.clone(),
            });
        }
        debug!("{}: {} chars", self.name, text.len());
        Ok(text)
    }
}

// ── Shared HTTP helpers ──────────────────────────────────────────────────

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

fn classify_transport(provider: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { secs: 0 }
    } else {
        ProviderError::Transport(format!("{provider}: {e}"))
    }
}

async fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> ProviderError {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = response.text().await.unwrap_or_default();
    let body = body.chars().take(500).collect::<String>();

    match status.as_u16() {
        401 | 403 => ProviderError::Auth {
            provider: provider.to_string(),
            detail: body,
        },
        429 => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after_secs: retry_after,
        },
        code => ProviderError::Api {
            provider: provider.to_string(),
            status: code,
            body,
        },
    }
}

// ── Environment factory ──────────────────────────────────────────────────

fn gemini_key() -> Option<String> {
    for key in ["GEMINI_API_KEY", "GOOGLE_API_KEY"] {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}

fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty())
}

/// Resolve the generator model from the environment.
///
/// Gemini is preferred when both credentials exist (it is the cheaper
/// high-volume generator); OpenAI is the fallback. At least one credential
/// is required.
pub fn generator_from_env(
    model_override: Option<&str>,
    timeout_secs: u64,
) -> Result<Arc<dyn VisionModel>, Pdf2HtmlError> {
    if let Some(key) = gemini_key() {
        let model = model_override.unwrap_or(DEFAULT_GEMINI_MODEL);
        return Ok(Arc::new(GeminiModel::new(key, model, timeout_secs)));
    }
    if let Some(key) = openai_key() {
        let model = model_override.unwrap_or(DEFAULT_OPENAI_MODEL);
        return Ok(Arc::new(OpenAiModel::new(key, model, timeout_secs)));
    }
    Err(Pdf2HtmlError::CredentialMissing {
        hint: "Set GEMINI_API_KEY (or GOOGLE_API_KEY), or OPENAI_API_KEY.".into(),
    })
}

/// Resolve the judge pair from the environment.
///
/// Judge A mirrors the generator's provider; judge B exists only when the
/// *other* provider also has a credential, which is what makes cross-model
/// judging possible.
pub fn judges_from_env(
    model_override: Option<&str>,
    timeout_secs: u64,
) -> Result<(Arc<dyn VisionModel>, Option<Arc<dyn VisionModel>>), Pdf2HtmlError> {
    match (gemini_key(), openai_key()) {
        (Some(g), Some(o)) => {
            let a: Arc<dyn VisionModel> = Arc::new(GeminiModel::new(
                g,
                model_override.unwrap_or(DEFAULT_GEMINI_MODEL),
                timeout_secs,
            ));
            let b: Arc<dyn VisionModel> =
                Arc::new(OpenAiModel::new(o, DEFAULT_OPENAI_MODEL, timeout_secs));
            Ok((a, Some(b)))
        }
        (Some(g), None) => Ok((
            Arc::new(GeminiModel::new(
                g,
                model_override.unwrap_or(DEFAULT_GEMINI_MODEL),
                timeout_secs,
            )),
            None,
        )),
        (None, Some(o)) => Ok((
            Arc::new(OpenAiModel::new(
                o,
                model_override.unwrap_or(DEFAULT_OPENAI_MODEL),
                timeout_secs,
            )),
            None,
        )),
        (None, None) => Err(Pdf2HtmlError::CredentialMissing {
            hint: "Set GEMINI_API_KEY (or GOOGLE_API_KEY), or OPENAI_API_KEY.".into(),
        }),
    }
}

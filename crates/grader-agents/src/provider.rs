//! Model providers implementing [`GradingCapability`].
//!
//! - [`OpenAiCapability`]: any OpenAI-compatible `/chat/completions` endpoint
//! - [`AnthropicCapability`]: Anthropic Messages API
//! - [`MockCapability`]: deterministic offline grader

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consensus::{CapabilityError, GradableUnit, GradingCapability, ReasoningStepKind};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};
use crate::prompts::GRADER_PREAMBLE;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("provider `{0}` needs an API key (set GRADER_API_KEY)")]
    MissingApiKey(&'static str),
}

/// Build the capability selected by `config.kind`.
pub fn build_capability(config: &ProviderConfig) -> Result<Arc<dyn GradingCapability>, ProviderError> {
    match config.kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiCapability::new(config)?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicCapability::new(config)?)),
        ProviderKind::Mock => Ok(Arc::new(MockCapability::default())),
    }
}

// ── OpenAI-compatible HTTP ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Chat-completions client.
pub struct OpenAiCapability {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl OpenAiCapability {
    /// Local endpoints (localhost, LAN inference servers) may run without a key.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let base_url = config.resolved_base_url();
        if base_url.contains("api.openai.com") && config.api_key.is_none() {
            return Err(ProviderError::MissingApiKey("openai"));
        }
        Ok(Self {
            http: http_client(config)?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.resolved_model().to_string(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GradingCapability for OpenAiCapability {
    async fn evaluate(
        &self,
        prompt: &str,
        unit: &GradableUnit,
        temperature: f32,
    ) -> Result<String, CapabilityError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: GRADER_PREAMBLE,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(unit = %unit.id, model = %self.model, "sending grading request");
        let response = builder.send().await.map_err(transport_error)?;
        let response = ensure_success(response).await?;

        let chat: ChatResponse = response.json().await.map_err(transport_error)?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CapabilityError::Transport("completion had no content".into()))
    }
}

// ── Anthropic Messages ───────────────────────────────────────────────────────

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Messages API client. Always needs a key.
pub struct AnthropicCapability {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicCapability {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or(ProviderError::MissingApiKey("anthropic"))?;
        Ok(Self {
            http: http_client(config)?,
            endpoint: format!("{}/messages", config.resolved_base_url().trim_end_matches('/')),
            api_key,
            model: config.resolved_model().to_string(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GradingCapability for AnthropicCapability {
    async fn evaluate(
        &self,
        prompt: &str,
        unit: &GradableUnit,
        temperature: f32,
    ) -> Result<String, CapabilityError> {
        let request = MessagesRequest {
            model: &self.model,
            system: GRADER_PREAMBLE,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature,
        };

        debug!(unit = %unit.id, model = %self.model, "sending grading request");
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response).await?;

        let message: MessagesResponse = response.json().await.map_err(transport_error)?;
        let text: Vec<String> = message
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(CapabilityError::Transport("message had no text content".into()));
        }
        Ok(text.join("\n"))
    }
}

// ── Shared HTTP plumbing ─────────────────────────────────────────────────────

fn http_client(config: &ProviderConfig) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()?)
}

/// Pass a success response through; map anything else to a capability error.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CapabilityError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &body))
}

fn transport_error(e: reqwest::Error) -> CapabilityError {
    if e.is_timeout() {
        CapabilityError::Timeout
    } else {
        CapabilityError::Transport(e.to_string())
    }
}

/// Map a non-success HTTP status to a capability error.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> CapabilityError {
    let detail = format!("HTTP {status}: {}", truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS {
        CapabilityError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CapabilityError::Transport(detail)
    } else {
        CapabilityError::Rejected(detail)
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

// ── Offline mock ─────────────────────────────────────────────────────────────

/// Deterministic grader: every criterion gets `fraction` of its maximum.
#[derive(Debug, Clone)]
pub struct MockCapability {
    fraction: f64,
    confidence: f64,
}

impl Default for MockCapability {
    fn default() -> Self {
        Self {
            fraction: 0.8,
            confidence: 0.85,
        }
    }
}

impl MockCapability {
    pub fn new(fraction: f64, confidence: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            confidence,
        }
    }

    fn response_for(&self, unit: &GradableUnit) -> String {
        let scores: serde_json::Map<String, serde_json::Value> = unit
            .criteria
            .iter()
            .map(|c| (c.name.clone(), json!(c.max_points * self.fraction)))
            .collect();
        let block = json!({
            "scores": scores,
            "confidence": self.confidence,
            "feedback": "Good analysis with clear insights. Code implementation is solid but could use more comments.",
            "suggestions": [
                "Add more detailed comments to your code",
                "Include axis labels and titles in your plots",
                "Consider discussing limitations of your analysis"
            ],
        });

        let mut text = String::new();
        for (i, kind) in ReasoningStepKind::ALL.into_iter().enumerate() {
            text.push_str(&format!("## Step {}: {}\n", i + 1, kind.label()));
            text.push_str("Mock assessment.\n\n");
        }
        text.push_str("```json\n");
        text.push_str(&serde_json::to_string_pretty(&block).unwrap_or_default());
        text.push_str("\n```\n");
        text
    }
}

#[async_trait]
impl GradingCapability for MockCapability {
    async fn evaluate(
        &self,
        _prompt: &str,
        unit: &GradableUnit,
        _temperature: f32,
    ) -> Result<String, CapabilityError> {
        Ok(self.response_for(unit))
    }
}

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use consensus::EngineConfig;
use serde::{Deserialize, Serialize};

/// Which model backend grades submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    #[default]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Deterministic offline grader.
    Mock,
}

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_MODEL: &str = "gpt-4";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_MODEL: &str = "claude-3-sonnet-20240229";

/// Model endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    /// HTTP-level timeout; the engine's per-attempt timeout still applies on top.
    pub request_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            base_url: OPENAI_BASE_URL.into(),
            api_key: None,
            model: OPENAI_MODEL.into(),
            max_tokens: 1500,
            request_timeout_ms: 120_000,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Base URL to call. An untouched OpenAI default follows `kind`.
    pub fn resolved_base_url(&self) -> &str {
        match self.kind {
            ProviderKind::Anthropic if self.base_url == OPENAI_BASE_URL => ANTHROPIC_BASE_URL,
            _ => &self.base_url,
        }
    }

    /// Model to request. An untouched OpenAI default follows `kind`.
    pub fn resolved_model(&self) -> &str {
        match self.kind {
            ProviderKind::Anthropic if self.model == OPENAI_MODEL => ANTHROPIC_MODEL,
            _ => &self.model,
        }
    }
}

/// Top-level grader configuration.
///
/// Layered: TOML file, then `GRADER_*` environment variables, then CLI flags.
///
/// ```toml
/// [engine]
/// attempt_count = 5
/// confidence_threshold = 0.7
///
/// [provider]
/// kind = "openai"
/// model = "gpt-4"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub engine: EngineConfig,
    pub provider: ProviderConfig,
}

impl GraderConfig {
    /// Load from a TOML file, or defaults when `path` is `None`, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML")
    }

    /// Apply `GRADER_BASE_URL`, `GRADER_API_KEY`, `GRADER_MODEL` and
    /// `GRADER_ATTEMPTS` from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("GRADER_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(key) = lookup("GRADER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(model) = lookup("GRADER_MODEL") {
            self.provider.model = model;
        }
        if let Some(attempts) = lookup("GRADER_ATTEMPTS") {
            self.engine.attempt_count = attempts
                .trim()
                .parse()
                .with_context(|| format!("GRADER_ATTEMPTS is not a number: {attempts:?}"))?;
        }
        Ok(())
    }
}

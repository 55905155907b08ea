//! Generator abstraction for AI-written responses.
//!
//! The [`Generator`] trait decouples the step executor from the completion
//! backend. [`OpenAiGenerator`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint; tests use scripted generators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::io::config::GenerationConfig;

/// Reserved completion meaning "do not act on this item".
pub const SKIP_SENTINEL: &str = "[SKIP]";

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl From<&GenerationConfig> for GenerationParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: GenerationParams,
}

/// Result of a successful generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Text(String),
    /// The backend returned [`SKIP_SENTINEL`].
    Skip,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("no generation credential configured")]
    MissingCredential,
    #[error("generation request failed with status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("generation transport error: {0}")]
    Transport(String),
    #[error("malformed generation response: {0}")]
    Malformed(String),
}

/// Abstraction over text-generation backends.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

/// Generator backed by an OpenAI-compatible chat completions API.
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiGenerator {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GenerationError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Build from config, reading the credential from `api_key_env` when the
    /// inline key is empty. A missing credential is reported on first use.
    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let api_key = if config.api_key.trim().is_empty() && !config.api_key_env.is_empty() {
            std::env::var(&config.api_key_env).unwrap_or_default()
        } else {
            config.api_key.clone()
        };
        Self::new(
            &config.base_url,
            &api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    #[instrument(skip_all, fields(model = %request.params.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        if self.api_key.trim().is_empty() {
            return Err(GenerationError::MissingCredential);
        }

        let body = json!({
            "model": request.params.model,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, prompt_bytes = request.prompt.len(), "calling generation API");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!("generation request failed: {err}");
                GenerationError::Transport(err.to_string())
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| GenerationError::Transport(err.to_string()))?;
        if !status.is_success() {
            error!(status = %status, "generation API error");
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                message: upstream_message(&text),
            });
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|err| GenerationError::Malformed(format!("invalid JSON: {err}")))?;
        parse_completion(&data)
    }
}

/// Extract the generation from a chat completions response body.
///
/// The sentinel is matched on the raw completion (modulo surrounding
/// whitespace) before quotes are stripped.
pub fn parse_completion(data: &Value) -> Result<Generation, GenerationError> {
    let content = data["choices"]
        .get(0)
        .and_then(|choice| choice["message"]["content"].as_str())
        .ok_or_else(|| GenerationError::Malformed("missing choices[0].message.content".into()))?;

    let trimmed = content.trim();
    if trimmed == SKIP_SENTINEL {
        return Ok(Generation::Skip);
    }
    let text = strip_wrapping_quotes(trimmed).trim();
    if text.is_empty() {
        return Err(GenerationError::Malformed("empty completion".into()));
    }
    Ok(Generation::Text(text.to_string()))
}

fn strip_wrapping_quotes(text: &str) -> &str {
    for (open, close) in [('"', '"'), ('\u{201c}', '\u{201d}')] {
        if let Some(inner) = text
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
        {
            return inner;
        }
    }
    text
}

fn upstream_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value["error"]["message"]
            .as_str()
            .or_else(|| value["error"].as_str())
            .map(str::to_string)
    });
    from_json.unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_CHARS).collect())
}

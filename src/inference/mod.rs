//! Inference backend abstraction and implementations.
//!
//! Defines the [`InferenceBackend`] trait and the two interchangeable
//! backends a chat session can be pointed at:
//! - **[`OpenAiBackend`]**: hosted chat-completions API, bearer-token auth.
//! - **[`OllamaBackend`]**: local Ollama `/api/chat`, optionally streamed.
//!
//! Both normalize their response shapes to plain completion text, so the
//! session controller only ever sees `complete(messages) -> text`.
//!
//! # Backend Selection
//!
//! A session holds a [`ModelSelector`]; the [`BackendRegistry`] maps it to
//! a backend. Switching models is a parameter change, not a reconnect.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Retry counts come from `inference.<backend>.max_retries`.

pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::models::Role;

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

/// One message of a backend request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A request/response text-completion service.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend identifier used in logs and errors (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Model the backend sends requests to (e.g. `"gpt-3.5-turbo"`).
    fn model(&self) -> &str;

    /// Send `messages` and return the first completion's text.
    ///
    /// A well-formed response with no completion is
    /// [`InferenceError::NoChoices`].
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, InferenceError>;
}

/// Which backend a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelector {
    OpenAi,
    Ollama,
}

impl ModelSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSelector::OpenAi => "openai",
            ModelSelector::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "chatgpt" | "gpt" => Ok(ModelSelector::OpenAi),
            "ollama" | "llama" => Ok(ModelSelector::Ollama),
            other => anyhow::bail!("Unknown model '{}'. Must be openai or ollama.", other),
        }
    }
}

/// Maps each [`ModelSelector`] to a backend.
pub struct BackendRegistry {
    backends: Vec<(ModelSelector, Arc<dyn InferenceBackend>)>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// Registry with both built-in backends.
    ///
    /// The OpenAI backend is only registered when `OPENAI_API_KEY` is set;
    /// selecting it otherwise fails with [`InferenceError::UnknownBackend`].
    pub fn from_config(config: &InferenceConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => {
                registry.register(
                    ModelSelector::OpenAi,
                    Arc::new(OpenAiBackend::new(&config.openai, key)?),
                );
            }
            _ => tracing::warn!("OPENAI_API_KEY not set; the openai backend is unavailable"),
        }
        registry.register(
            ModelSelector::Ollama,
            Arc::new(OllamaBackend::new(&config.ollama)?),
        );
        Ok(registry)
    }

    /// Register a backend, replacing any previous one for the same selector.
    pub fn register(&mut self, selector: ModelSelector, backend: Arc<dyn InferenceBackend>) {
        self.backends.retain(|(s, _)| *s != selector);
        self.backends.push((selector, backend));
    }

    pub fn get(&self, selector: ModelSelector) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
        self.backends
            .iter()
            .find(|(s, _)| *s == selector)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| InferenceError::UnknownBackend(selector.to_string()))
    }

    pub fn available(&self) -> Vec<ModelSelector> {
        self.backends.iter().map(|(s, _)| *s).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a request with retry/backoff, returning the first 2xx response.
///
/// `build` is called once per attempt because a `RequestBuilder` cannot be
/// reused after sending.
pub(crate) async fn send_with_retry<F>(
    backend: &str,
    max_retries: u32,
    build: F,
) -> Result<reqwest::Response, InferenceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(backend, attempt, ?delay, "retrying inference request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = InferenceError::Http {
                    backend: backend.to_string(),
                    status: status.as_u16(),
                    message: error_message(&body_text),
                    retryable: status.as_u16() == 429 || status.is_server_error(),
                };
                if !err.is_retryable() {
                    return Err(err);
                }
                last_err = Some(err);
            }
            Err(e) => {
                last_err = Some(InferenceError::Network {
                    backend: backend.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| InferenceError::Network {
        backend: backend.to_string(),
        message: "request failed after retries".to_string(),
    }))
}

/// Pull a readable message out of an error body.
///
/// Handles `{"error": {"message": ..}}` (OpenAI) and `{"error": ".."}`
/// (Ollama); anything else is returned truncated.
fn error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    body.chars().take(500).collect()
}

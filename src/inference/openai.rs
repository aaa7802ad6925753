//! Hosted chat-completions backend (OpenAI API).
//!
//! Request:
//!
//! ```json
//! { "model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "..."}], "max_tokens": 500 }
//! ```
//!
//! Response: `choices[0].message.content`. Authenticated with
//! `Authorization: Bearer $OPENAI_API_KEY`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{send_with_retry, InferenceBackend, PromptMessage};
use crate::config::OpenAiConfig;
use crate::error::InferenceError;

const BACKEND: &str = "openai";

pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiBackend {
    pub fn new(config: &OpenAiConfig, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: api_key.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn extract_text(response: ChatCompletionResponse) -> Result<String, InferenceError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| InferenceError::NoChoices {
            backend: BACKEND.to_string(),
        })
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, InferenceError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
        };

        let response = send_with_retry(BACKEND, self.max_retries, || {
            self.client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        let text = response.text().await.map_err(|e| InferenceError::Network {
            backend: BACKEND.to_string(),
            message: e.to_string(),
        })?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| InferenceError::Malformed {
                backend: BACKEND.to_string(),
                message: e.to_string(),
            })?;

        extract_text(parsed)
    }
}

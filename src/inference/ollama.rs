//! Local Ollama backend (`POST {url}/api/chat`).
//!
//! With `stream = false` Ollama answers with one JSON object:
//!
//! ```json
//! { "model": "llama2", "message": { "role": "assistant", "content": "..." }, "done": true }
//! ```
//!
//! With `stream = true` the body is NDJSON, one partial message per line,
//! ending with a `"done": true` line. The body is consumed chunk by chunk and
//! the content fragments concatenated, so both modes return the same text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{send_with_retry, InferenceBackend, PromptMessage};
use crate::config::OllamaConfig;
use crate::error::InferenceError;

const BACKEND: &str = "ollama";

pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    stream: bool,
    max_retries: u32,
}

impl OllamaBackend {
    pub fn new(config: &OllamaConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            stream: config.stream,
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.url)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

fn malformed(message: impl Into<String>) -> InferenceError {
    InferenceError::Malformed {
        backend: BACKEND.to_string(),
        message: message.into(),
    }
}

/// Accumulates streamed chunks into the final completion.
#[derive(Default)]
struct StreamAccumulator {
    buffer: Vec<u8>,
    text: String,
    saw_message: bool,
    done: bool,
}

impl StreamAccumulator {
    /// Feed raw body bytes; complete lines are parsed immediately.
    fn push(&mut self, bytes: &[u8]) -> Result<(), InferenceError> {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.line(&line)?;
        }
        Ok(())
    }

    fn line(&mut self, line: &[u8]) -> Result<(), InferenceError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let chunk: ChatChunk = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
        if let Some(err) = chunk.error {
            return Err(malformed(err));
        }
        if let Some(message) = chunk.message {
            self.saw_message = true;
            self.text.push_str(&message.content);
        }
        self.done |= chunk.done;
        Ok(())
    }

    fn finish(mut self) -> Result<String, InferenceError> {
        let rest = std::mem::take(&mut self.buffer);
        self.line(&rest)?;
        if !self.saw_message {
            return Err(InferenceError::NoChoices {
                backend: BACKEND.to_string(),
            });
        }
        if !self.done {
            tracing::warn!(backend = BACKEND, "stream ended without a done marker");
        }
        Ok(self.text)
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, InferenceError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: self.stream,
        };
        let endpoint = self.endpoint();

        let mut response = send_with_retry(BACKEND, self.max_retries, || {
            self.client
                .post(&endpoint)
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        // A single JSON object is just a one-line stream, so both modes share
        // the accumulator.
        let mut acc = StreamAccumulator::default();
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => acc.push(&bytes)?,
                Ok(None) => break,
                Err(e) => {
                    return Err(InferenceError::Network {
                        backend: BACKEND.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        acc.finish()
    }
}

//! Streaming LLM client
//!
//! Talks to an OpenAI-compatible chat completions API and feeds response text
//! increments into a channel as they arrive. Consumers drop the receiver to
//! stop a generation early; the producer task notices the closed channel and
//! exits without treating it as a failure.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::LlmConfig;
use crate::prompts;

/// Spoken to the user when the generation service rejects the request
pub const APOLOGY: &str = "I'm sorry, I'm having trouble responding right now.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One item of a streaming generation
#[derive(Debug)]
pub enum StreamEvent {
    /// A text increment
    Content(String),
    /// The provider failed before or during generation; no more items follow
    Failed(String),
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Streaming response generator
pub struct ResponseGenerator {
    client: reqwest::Client,
    config: LlmConfig,
}

impl ResponseGenerator {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Stream a voice-mode response. Text increments arrive on the returned
    /// channel; an upstream failure arrives as a single terminal
    /// [`StreamEvent::Failed`].
    pub fn stream_voice(
        &self,
        user_message: &str,
        context: &str,
        chat_history: &str,
    ) -> mpsc::Receiver<StreamEvent> {
        self.stream(
            self.config.voice_model.clone(),
            prompts::voice_system_prompt(context, chat_history),
            user_message.to_string(),
            self.config.voice_max_tokens,
        )
    }

    /// Stream a text-chat response.
    pub fn stream_chat(
        &self,
        user_message: &str,
        context: &str,
        chat_history: &str,
    ) -> mpsc::Receiver<StreamEvent> {
        self.stream(
            self.config.chat_model.clone(),
            prompts::chat_system_prompt(context, chat_history),
            user_message.to_string(),
            self.config.chat_max_tokens,
        )
    }

    fn stream(
        &self,
        model: String,
        system_content: String,
        user_message: String,
        max_tokens: u32,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let base_url = self.config.base_url.clone();
        let api_key = self.config.api_key.clone().unwrap_or_default();

        tokio::spawn(async move {
            let request = ChatRequest {
                model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: system_content,
                    },
                    ChatMessage {
                        role: "user",
                        content: user_message,
                    },
                ],
                max_completion_tokens: max_tokens,
                stream: true,
            };

            if let Err(e) = run_stream(&client, &base_url, &api_key, &request, &tx).await {
                error!("LLM stream failed: {}", e);
                let _ = tx.send(StreamEvent::Failed(e.to_string())).await;
            }
        });

        rx
    }
}

/// Drive one streaming completion, forwarding content deltas into `tx`.
/// A closed channel means the consumer gave up; that ends the stream quietly.
async fn run_stream(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    request: &ChatRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let response = client
        .post(format!("{}/chat/completions", base_url))
        .header("Authorization", format!("Bearer {}", api_key))
        .timeout(REQUEST_TIMEOUT)
        .json(request)
        .send()
        .await
        .context("Failed to send request to LLM provider")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("LLM API error ({}): {}", status, body);
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read stream chunk")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Parse SSE events
        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();

            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }
                if let Some(content) = delta_content(data) {
                    if tx.send(StreamEvent::Content(content)).await.is_err() {
                        debug!("LLM stream consumer gone, stopping generation");
                        return Ok(());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Extract the content delta from one SSE data payload. Malformed payloads
/// are dropped, never fatal.
fn delta_content(data: &str) -> Option<String> {
    let parsed: StreamResponse = serde_json::from_str(data).ok()?;
    parsed.choices.into_iter().next()?.delta.content.filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_content_extracts_text() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(delta_content(data), Some("Hello".to_string()));
    }

    #[test]
    fn test_delta_content_empty_delta() {
        assert_eq!(delta_content(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(delta_content(r#"{"choices":[]}"#), None);
    }

    #[test]
    fn test_delta_content_malformed_json() {
        assert_eq!(delta_content("not json"), None);
    }
}

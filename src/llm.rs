//! Chat-completion client for OpenAI-compatible endpoints.
//!
//! [`ChatProvider`] is the seam the RAG assembler talks to; [`ChatClient`]
//! implements it against `POST {base_url}/chat/completions`.
//!
//! Streaming responses are Server-Sent Events. A background task reads the
//! body, splits it into `data:` lines (buffering lines split across network
//! chunks), and forwards each `choices[0].delta.content` fragment through a
//! bounded channel until `data: [DONE]`. Dropping the receiver makes the
//! next send fail, which ends the task and drops the HTTP response.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::LlmConfig;

const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A chat model that answers a message list whole or as a stream of
/// text fragments.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    async fn stream(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>>;
}

pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from `[llm]`. A missing API key is allowed, for
    /// local servers that do not check it.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::debug!(var = %config.api_key_env, "no LLM API key in environment");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("chat completion request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, text);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatProvider for ChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let resp = self.send(&self.body(messages, false)).await?;
        let payload: serde_json::Value = resp.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing message content"))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>> {
        let resp = self.send(&self.body(messages, true)).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut body = resp.bytes_stream();

        tokio::spawn(async move {
            let mut lines = SseLines::default();
            while let Some(item) = body.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                for event in lines.push(&bytes) {
                    match event {
                        SseEvent::Done => return,
                        SseEvent::Delta(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                tracing::debug!("chat stream receiver dropped");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental `data:` line parser for an SSE byte stream.
#[derive(Default)]
struct SseLines {
    partial: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                break;
            }
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                if let Some(content) = json["choices"][0]["delta"]["content"].as_str() {
                    if !content.is_empty() {
                        events.push(SseEvent::Delta(content.to_string()));
                    }
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
        )
    }

    #[test]
    fn test_sse_lines_across_chunks() {
        let mut parser = SseLines::default();
        let full = format!("{}{}data: [DONE]\n", delta("Hel"), delta("lo"));
        let (a, b) = full.as_bytes().split_at(17);

        let mut events = parser.push(a);
        events.extend(parser.push(b));
        assert_eq!(
            events,
            vec![
                SseEvent::Delta("Hel".into()),
                SseEvent::Delta("lo".into()),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn test_sse_ignores_comments_and_role_only_deltas() {
        let mut parser = SseLines::default();
        let role_only = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n";
        let events = parser.push(format!(": keep-alive\n{}{}", role_only, delta("x")).as_bytes());
        assert_eq!(events, vec![SseEvent::Delta("x".into())]);
    }

    #[test]
    fn test_request_body_shape() {
        let client = ChatClient::new(&LlmConfig::default()).unwrap();
        let body = client.body(&[ChatMessage::user("hi")], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1000);
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::agent_api::WireMessage;
use shared::settings::Tweaks;
use shared::ChatError;
use std::ops::ControlFlow;

/// Body of `POST /api/chat`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChatOptions {
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl ChatRequest {
    /// Streaming chat turn with the user's tuning applied. A zero seed is omitted.
    pub fn streaming(model: impl Into<String>, messages: Vec<WireMessage>, tweaks: &Tweaks) -> Self {
        Self {
            model: model.into(),
            messages,
            options: Some(ChatOptions {
                temperature: tweaks.temperature,
                seed: (tweaks.seed != 0).then_some(tweaks.seed),
            }),
            keep_alive: Some(format!("{}m", tweaks.keep_alive_minutes)),
            stream: true,
        }
    }

    /// Single-response request without tuning (used for side tasks like titles).
    pub fn one_shot(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: None,
            keep_alive: None,
            stream: false,
        }
    }
}

/// Streaming response: each line is one of these JSON objects.
/// The non-streaming response has the same shape.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl ChatChunk {
    pub fn content(&self) -> &str {
        self.message.as_ref().map(|m| m.content.as_str()).unwrap_or("")
    }
}

/// Anything that can serve chat completions.
///
/// Note: Uses async_trait for object safety
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One-shot, non-streaming completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatChunk, ChatError>;

    /// Streaming completion. Chunks are handed to `on_chunk` in arrival order
    /// up to and including the first `done` chunk, or until `on_chunk` breaks.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_chunk: &mut (dyn FnMut(ChatChunk) -> ControlFlow<()> + Send),
    ) -> Result<(), ChatError>;

    /// Bring the backend back after a connection error. Remote backends have
    /// nothing to do.
    async fn recover(&self) -> Result<(), ChatError> {
        Ok(())
    }
}

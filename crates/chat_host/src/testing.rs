//! Scripted backend for exercising sessions and runners without a server.

use async_trait::async_trait;
use parking_lot::Mutex;
use providers::ollama::ChunkMessage;
use providers::{ChatBackend, ChatChunk, ChatRequest};
use shared::ChatError;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};

fn chunk(content: &str, done: bool) -> ChatChunk {
    ChatChunk {
        message: Some(ChunkMessage {
            role: Some("assistant".into()),
            content: content.into(),
        }),
        done,
    }
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    chunks: Vec<ChatChunk>,
    send_done: bool,
    after_done: Vec<ChatChunk>,
    failure: Option<String>,
    hang: bool,
    reply: String,
    requests: Mutex<Vec<ChatRequest>>,
    recoveries: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            send_done: true,
            ..Self::default()
        }
    }

    pub fn with_chunks(mut self, parts: &[&str]) -> Self {
        self.chunks = parts.iter().map(|p| chunk(p, false)).collect();
        self
    }

    /// End the stream without a final `done` chunk.
    pub fn without_done(mut self) -> Self {
        self.send_done = false;
        self
    }

    /// Send `done` after the scripted chunks, then keep streaming `parts`
    /// regardless of what the caller returns.
    pub fn streaming_after_done(mut self, parts: &[&str]) -> Self {
        self.after_done = parts.iter().map(|p| chunk(p, false)).collect();
        self.send_done = false;
        self
    }

    /// Fail with a network error after the scripted chunks.
    pub fn fail_with(mut self, reason: &str) -> Self {
        self.failure = Some(reason.into());
        self.send_done = false;
        self
    }

    /// Never finish after the scripted chunks.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Content of every one-shot reply.
    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.into();
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatChunk, ChatError> {
        self.requests.lock().push(request.clone());
        Ok(chunk(&self.reply, true))
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_chunk: &mut (dyn FnMut(ChatChunk) -> ControlFlow<()> + Send),
    ) -> Result<(), ChatError> {
        self.requests.lock().push(request.clone());
        for part in &self.chunks {
            if on_chunk(part.clone()).is_break() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        if !self.after_done.is_empty() {
            let _ = on_chunk(chunk("", true));
            for part in &self.after_done {
                tokio::task::yield_now().await;
                let _ = on_chunk(part.clone());
            }
        }
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(reason) = &self.failure {
            return Err(ChatError::network(reason.clone()));
        }
        if self.send_done {
            let _ = on_chunk(chunk("", true));
        }
        Ok(())
    }

    async fn recover(&self) -> Result<(), ChatError> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

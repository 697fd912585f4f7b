//! Streaming request runner: carries one user turn from request to final message.

use chrono::Utc;
use futures::future::{Abortable, Aborted};
use providers::{ChatBackend, ChatChunk, ChatRequest};
use shared::events::{SessionEvent, TurnOutcome};
use shared::message::{Message, Role};
use shared::settings::Tweaks;
use shared::ChatError;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use services::ChatStore;

use crate::session::{PendingTurn, SharedSession};
use crate::title::TitleGenerator;

/// How a turn ended, when it did not fail
#[derive(Debug, Clone)]
pub struct FinishedTurn {
    pub message: Message,
    pub outcome: TurnOutcome,
}

pub struct StreamRunner {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn ChatStore>,
    events: Option<UnboundedSender<SessionEvent>>,
    tweaks: Tweaks,
    titles: Option<Arc<TitleGenerator>>,
}

impl StreamRunner {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<dyn ChatStore>, tweaks: Tweaks) -> Self {
        Self {
            backend,
            store,
            events: None,
            tweaks,
            titles: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_titles(mut self, titles: Arc<TitleGenerator>) -> Self {
        self.titles = Some(titles);
        self
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Stream the assistant reply for `turn` into `session`. A regenerated
    /// reply takes the place of the one it replaces in the store.
    ///
    /// Whatever happens, the session is `Idle` again when this returns and the
    /// assistant message is finalized. Transport failures come back as
    /// `ChatError::Network` exactly once; they are never retried.
    pub async fn run(&self, session: SharedSession, turn: PendingTurn) -> Result<FinishedTurn, ChatError> {
        let PendingTurn {
            session_id,
            user,
            assistant,
            replaces,
            model,
            messages,
            registration,
            first_reply,
        } = turn;
        let message_id = assistant.id.clone();

        if let Some(replaced) = &replaces {
            if let Err(e) = self.store.delete_message(replaced) {
                tracing::warn!(%session_id, message_id = %replaced, error = %e, "failed to remove replaced reply");
            }
        }
        for message in user.iter().chain([&assistant]) {
            if let Err(e) = self.store.insert_message(&session_id, message) {
                tracing::warn!(%session_id, message_id = %message.id, error = %e, "failed to store message");
            }
        }

        self.emit(SessionEvent::TurnStarted {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        });

        let title_prompt = messages.iter().find(|m| m.role == Role::User).cloned();
        let request = ChatRequest::streaming(model.clone(), messages, &self.tweaks);
        tracing::debug!(%session_id, %message_id, %model, "streaming turn");

        // fires on the first `done` chunk, even if the backend keeps streaming
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let stream = {
            let backend = self.backend.clone();
            let session = session.clone();
            let events = self.events.clone();
            let session_id = session_id.clone();
            let message_id = message_id.clone();
            let mut done_tx = Some(done_tx);
            async move {
                let mut on_chunk = move |chunk: ChatChunk| {
                    if done_tx.is_none() {
                        return ControlFlow::Break(());
                    }
                    let content = chunk.content();
                    if !content.is_empty() {
                        let appended = session.lock().append_chunk(&message_id, content);
                        if let (true, Some(events)) = (appended, &events) {
                            let _ = events.send(SessionEvent::Chunk {
                                session_id: session_id.clone(),
                                message_id: message_id.clone(),
                                content: content.to_string(),
                            });
                        }
                    }
                    if !chunk.done {
                        return ControlFlow::Continue(());
                    }
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send(());
                    }
                    ControlFlow::Break(())
                };
                backend.chat_stream(&request, &mut on_chunk).await
            }
        };

        let streamed = Abortable::new(stream, registration);
        let outcome = tokio::select! {
            biased;
            Ok(()) = done_rx => Ok(TurnOutcome::Completed),
            result = streamed => match result {
                Ok(Ok(())) => Ok(TurnOutcome::Completed),
                Ok(Err(e)) => Err(e),
                Err(Aborted) => Ok(TurnOutcome::Cancelled),
            },
        };

        let message = session.lock().finish_turn(&message_id).unwrap_or_else(|| {
            let mut message = assistant;
            message.finished_at = Some(Utc::now());
            message
        });
        if let Err(e) = self.store.update_message(&message) {
            tracing::warn!(%session_id, %message_id, error = %e, "failed to store finalized message");
        }

        match outcome {
            Ok(outcome) => {
                tracing::info!(%session_id, %message_id, ?outcome, chars = message.content.len(), "turn finished");
                if outcome == TurnOutcome::Completed && first_reply {
                    self.maybe_generate_title(&session, &session_id, &model, title_prompt);
                }
                self.emit(SessionEvent::TurnFinished {
                    session_id,
                    message: message.clone(),
                    outcome,
                });
                Ok(FinishedTurn { message, outcome })
            }
            Err(e) => {
                tracing::error!(%session_id, %message_id, error = %e, "turn failed");
                self.emit(SessionEvent::TurnFailed {
                    session_id,
                    message,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn maybe_generate_title(
        &self,
        session: &SharedSession,
        session_id: &str,
        model: &str,
        prompt: Option<shared::agent_api::WireMessage>,
    ) {
        let (Some(titles), Some(prompt)) = (&self.titles, prompt) else {
            return;
        };
        if session.lock().claim_title() {
            titles.spawn(session_id.to_string(), model.to_string(), prompt);
        }
    }
}

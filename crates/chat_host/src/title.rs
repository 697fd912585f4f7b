//! Background chat naming after the first reply.

use providers::{ChatBackend, ChatRequest};
use shared::agent_api::WireMessage;
use shared::events::SessionEvent;
use shared::message::Role;
use shared::ChatError;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::registry::SessionRegistry;

pub const TITLE_PROMPT: &str = "\
Generate a title following these rules:
    - The title should be based on the user's prompt
    - Keep it in the same language as the prompt
    - The title needs to be less than 30 characters
    - Use only alphanumeric characters, spaces and optionally emojis
    - Just write the title, NOTHING ELSE
";

const MAX_TITLE_CHARS: usize = 50;

/// Tidy a model-written title: drop a `Title:` prefix, quotes and line breaks,
/// title-case it and cap its length.
pub fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("Title: ")
        .or_else(|| trimmed.strip_prefix("title: "))
        .unwrap_or(trimmed);
    let unquoted = trimmed
        .trim_matches(|c| c == '\'' || c == '"')
        .replace('\n', " ");

    let title = title_case(unquoted.trim()).replace("'S", "'s");

    if title.chars().count() > MAX_TITLE_CHARS {
        let cut: String = title.chars().take(MAX_TITLE_CHARS).collect();
        format!("{}...", cut)
    } else {
        title
    }
}

/// Uppercase the first letter of every run of letters, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

pub struct TitleGenerator {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<SessionRegistry>,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl TitleGenerator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: Arc<SessionRegistry>,
        events: Option<UnboundedSender<SessionEvent>>,
    ) -> Self {
        Self {
            backend,
            registry,
            events,
        }
    }

    /// Run [`Self::generate`] on its own task; failures are only logged.
    pub fn spawn(self: &Arc<Self>, session_id: String, model: String, prompt: WireMessage) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.generate(&session_id, &model, prompt).await {
                tracing::warn!(%session_id, error = %e, "title generation failed");
            }
        })
    }

    /// Ask the model for a title and rename the chat if it still has its
    /// placeholder name. Returns the applied name.
    pub async fn generate(
        &self,
        session_id: &str,
        model: &str,
        prompt: WireMessage,
    ) -> Result<Option<String>, ChatError> {
        tracing::debug!(%session_id, "generating chat title");
        let request = ChatRequest::one_shot(
            model,
            vec![WireMessage::new(Role::System, TITLE_PROMPT), prompt],
        );
        let reply = self.backend.chat(&request).await?;

        let title = clean_title(reply.content());
        if title.is_empty() {
            return Ok(None);
        }

        let applied = self.registry.rename_placeholder(session_id, &title)?;
        if let (Some(name), Some(events)) = (&applied, &self.events) {
            let _ = events.send(SessionEvent::TitleGenerated {
                session_id: session_id.to_string(),
                title: name.clone(),
            });
        }
        Ok(applied)
    }
}

//! Entry point for callers: routes user actions to the right session and runs
//! turns on background tasks.

use parking_lot::RwLock;
use providers::ChatBackend;
use shared::events::SessionEvent;
use shared::message::{generate_id, Attachment, Message};
use shared::settings::{AppSettings, Tweaks};
use shared::ChatError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use services::{export, ChatStore, MemoryStore, SqliteStore};

use crate::registry::SessionRegistry;
use crate::runner::{FinishedTurn, StreamRunner};
use crate::session::{ChatSession, PendingTurn, SharedSession};
use crate::title::TitleGenerator;

pub type TurnHandle = JoinHandle<Result<FinishedTurn, ChatError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    /// Markdown with callout blocks
    Obsidian,
    Json,
    JsonWithMetadata,
}

impl ExportFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "md" | "markdown" => Some(ExportFormat::Markdown),
            "obsidian" => Some(ExportFormat::Obsidian),
            "json" => Some(ExportFormat::Json),
            "json-meta" | "json+meta" => Some(ExportFormat::JsonWithMetadata),
            _ => None,
        }
    }
}

pub struct ChatHost {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<SessionRegistry>,
    titles: Arc<TitleGenerator>,
    events: UnboundedSender<SessionEvent>,
    tweaks: RwLock<Tweaks>,
    model: RwLock<Option<String>>,
}

impl ChatHost {
    /// Load history from `store` and return the host with its event stream.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn ChatStore>,
        settings: &AppSettings,
    ) -> Result<(Self, UnboundedReceiver<SessionEvent>), ChatError> {
        let registry = Arc::new(SessionRegistry::load(store)?);
        let (events, rx) = unbounded_channel();
        let titles = Arc::new(TitleGenerator::new(
            backend.clone(),
            registry.clone(),
            Some(events.clone()),
        ));
        let host = Self {
            backend,
            registry,
            titles,
            events,
            tweaks: RwLock::new(settings.tweaks),
            model: RwLock::new(settings.default_model.clone()),
        };
        Ok((host, rx))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn model(&self) -> Option<String> {
        self.model.read().clone()
    }

    pub fn set_model(&self, model: Option<String>) {
        *self.model.write() = model.filter(|m| !m.trim().is_empty());
    }

    pub fn tweaks(&self) -> Tweaks {
        *self.tweaks.read()
    }

    /// Applies to turns started after the call.
    pub fn set_tweaks(&self, tweaks: Tweaks) {
        *self.tweaks.write() = tweaks;
    }

    fn session(&self, name: &str) -> Result<SharedSession, ChatError> {
        self.registry.get(name).ok_or_else(|| ChatError::NotFound {
            name: name.to_string(),
        })
    }

    /// Validate and start a turn. Returns as soon as the user message is
    /// recorded; the reply streams on a spawned task.
    pub fn send_user_message(
        &self,
        chat: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<TurnHandle, ChatError> {
        let session = self.session(chat)?;
        let model = self.model();
        let turn = session
            .lock()
            .send_user_message(text, attachments, model.as_deref())?;
        Ok(self.spawn_turn(session, turn))
    }

    /// Replace the last reply of `chat` (typically a failed one) with a new
    /// answer to the same history.
    pub fn regenerate(&self, chat: &str) -> Result<TurnHandle, ChatError> {
        let session = self.session(chat)?;
        let model = self.model();
        let turn = session.lock().regenerate(model.as_deref())?;
        Ok(self.spawn_turn(session, turn))
    }

    fn spawn_turn(&self, session: SharedSession, turn: PendingTurn) -> TurnHandle {
        let runner = StreamRunner::new(self.backend.clone(), self.registry.store().clone(), self.tweaks())
            .with_events(self.events.clone())
            .with_titles(self.titles.clone());
        tokio::spawn(async move { runner.run(session, turn).await })
    }

    pub fn send_system_message(&self, chat: &str, text: &str) -> Result<Message, ChatError> {
        let session = self.session(chat)?;
        let (session_id, message) = {
            let mut session = session.lock();
            let message = session.send_system_message(text)?;
            (session.id().to_string(), message)
        };
        if let Err(e) = self.registry.store().insert_message(&session_id, &message) {
            tracing::warn!(%session_id, error = %e, "failed to store system message");
        }
        Ok(message)
    }

    /// Cancel the running turn of `chat`. Returns false if it was idle.
    pub fn stop(&self, chat: &str) -> Result<bool, ChatError> {
        Ok(self.session(chat)?.lock().stop())
    }

    /// One-off question in a throwaway session that is never stored or titled.
    pub fn quick_ask(&self, text: &str) -> Result<(SharedSession, TurnHandle), ChatError> {
        let session = ChatSession::new(generate_id(), "Quick Ask").into_shared();
        let model = self.model();
        let turn = session
            .lock()
            .send_user_message(text, Vec::new(), model.as_deref())?;

        let runner = StreamRunner::new(self.backend.clone(), Arc::new(MemoryStore::new()), self.tweaks())
            .with_events(self.events.clone());
        let handle = {
            let session = session.clone();
            tokio::spawn(async move { runner.run(session, turn).await })
        };
        Ok((session, handle))
    }

    /// Keep a finished Quick Ask as a regular chat, numbered if the name is taken.
    pub fn save_quick_ask(&self, session: &SharedSession) -> Result<SharedSession, ChatError> {
        let snapshot = {
            let session = session.lock();
            if session.is_busy() {
                return Err(ChatError::Busy {
                    session: session.name().to_string(),
                });
            }
            session.to_stored()
        };
        if snapshot.messages.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        self.registry.adopt(snapshot)
    }

    /// Bring the backend back after a `Network` error.
    pub async fn recover(&self) -> Result<(), ChatError> {
        self.backend.recover().await
    }

    pub fn search(&self, chat: &str, pattern: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.session(chat)?.lock().search(pattern))
    }

    /// Write `chat` into the database at `path`, creating it if needed. The
    /// file can be brought back with [`ChatHost::import_db`].
    pub fn export_db(&self, chat: &str, path: &Path) -> Result<(), ChatError> {
        let snapshot = self.session(chat)?.lock().to_stored();
        let target = SqliteStore::open(path)?;
        target.insert_session_with_messages(&snapshot)?;
        tracing::info!(chat, path = %path.display(), "chat exported to database");
        Ok(())
    }

    /// Add every chat stored in the database at `path`.
    pub fn import_db(&self, path: &Path) -> Result<Vec<SharedSession>, ChatError> {
        if !path.is_file() {
            return Err(ChatError::NotFound {
                name: path.display().to_string(),
            });
        }
        let source = SqliteStore::open(path)?;
        source
            .load_sessions()?
            .into_iter()
            .map(|chat| self.registry.adopt(chat))
            .collect()
    }

    pub fn export(&self, chat: &str, format: ExportFormat) -> Result<String, ChatError> {
        let session = self.session(chat)?;
        let session = session.lock();
        let (name, messages) = (session.name(), session.messages());
        Ok(match format {
            ExportFormat::Markdown => export::to_markdown(name, messages, false),
            ExportFormat::Obsidian => export::to_markdown(name, messages, true),
            ExportFormat::Json => export::to_json(name, messages, false),
            ExportFormat::JsonWithMetadata => export::to_json(name, messages, true),
        })
    }
}

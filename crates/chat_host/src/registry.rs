//! Session registry: owns every chat and keeps display names unique.
//!
//! Writes go to the store before memory is touched, so a storage failure leaves
//! the registry as it was. Lock order is registry, then session.

use parking_lot::RwLock;
use shared::message::generate_id;
use shared::naming::{is_placeholder_name, unique_name, DEFAULT_CHAT_NAME};
use shared::ChatError;
use std::sync::Arc;

use services::{ChatStore, StoredSession};

use crate::session::{ChatSession, SharedSession};

/// Row in the chat list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub busy: bool,
    pub message_count: usize,
}

pub struct SessionRegistry {
    /// Most recently created or active first
    sessions: RwLock<Vec<SharedSession>>,
    store: Arc<dyn ChatStore>,
}

fn find_by_name(sessions: &[SharedSession], name: &str) -> Option<SharedSession> {
    sessions.iter().find(|s| s.lock().name() == name).cloned()
}

fn name_taken(sessions: &[SharedSession], name: &str) -> bool {
    sessions.iter().any(|s| s.lock().name() == name)
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            store,
        }
    }

    /// Populate from the store; an empty history gets one fresh chat.
    pub fn load(store: Arc<dyn ChatStore>) -> Result<Self, ChatError> {
        let stored = store.load_sessions()?;
        let registry = Self::new(store);
        {
            let mut sessions = registry.sessions.write();
            for session in stored {
                sessions.push(ChatSession::from_stored(session).into_shared());
            }
        }
        tracing::info!(chats = registry.len(), "chat history loaded");
        if registry.is_empty() {
            registry.create(None)?;
        }
        Ok(registry)
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// New empty chat. A taken name (or none) gets a numbered variant.
    pub fn create(&self, name: Option<&str>) -> Result<SharedSession, ChatError> {
        let base = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_CHAT_NAME);

        let mut sessions = self.sessions.write();
        let name = unique_name(base, |candidate| name_taken(&sessions, candidate));
        let id = generate_id();
        self.store.insert_session(&id, &name)?;

        tracing::info!(session_id = %id, %name, "chat created");
        let session = ChatSession::new(id, name).into_shared();
        sessions.insert(0, session.clone());
        Ok(session)
    }

    pub fn get(&self, name: &str) -> Option<SharedSession> {
        find_by_name(&self.sessions.read(), name)
    }

    pub fn get_by_id(&self, id: &str) -> Option<SharedSession> {
        self.sessions.read().iter().find(|s| s.lock().id() == id).cloned()
    }

    pub fn first(&self) -> Option<SharedSession> {
        self.sessions.read().first().cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions.read().iter().map(|s| s.lock().name().to_string()).collect()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .iter()
            .map(|s| {
                let s = s.lock();
                SessionSummary {
                    id: s.id().to_string(),
                    name: s.name().to_string(),
                    busy: s.is_busy(),
                    message_count: s.messages().len(),
                }
            })
            .collect()
    }

    /// Rename keeping id and messages. Renaming to the current name, or
    /// repeating the rename that gave `new_name` its chat, succeeds without
    /// writing.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<(), ChatError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ChatError::EmptyInput);
        }

        let sessions = self.sessions.write();
        let existing = find_by_name(&sessions, new_name);
        let Some(session) = find_by_name(&sessions, old_name) else {
            let repeated = existing.is_some_and(|s| s.lock().previous_name() == Some(old_name));
            if repeated {
                return Ok(());
            }
            return Err(ChatError::NotFound {
                name: old_name.to_string(),
            });
        };
        if old_name == new_name {
            return Ok(());
        }
        if existing.is_some() {
            return Err(ChatError::DuplicateName {
                name: new_name.to_string(),
            });
        }

        let mut session = session.lock();
        self.store.rename_session(session.id(), new_name)?;
        tracing::info!(session_id = %session.id(), from = %old_name, to = %new_name, "chat renamed");
        session.set_name(new_name);
        Ok(())
    }

    /// Apply a generated title unless the user named the chat in the meantime.
    pub fn rename_placeholder(&self, session_id: &str, title: &str) -> Result<Option<String>, ChatError> {
        let sessions = self.sessions.write();
        let Some(session) = sessions.iter().find(|s| s.lock().id() == session_id).cloned() else {
            return Ok(None);
        };
        if !is_placeholder_name(session.lock().name()) {
            return Ok(None);
        }

        let name = unique_name(title, |candidate| {
            sessions
                .iter()
                .any(|s| !Arc::ptr_eq(s, &session) && s.lock().name() == candidate)
        });
        let mut session = session.lock();
        self.store.rename_session(session_id, &name)?;
        tracing::info!(%session_id, %name, "chat titled");
        session.set_name(name.clone());
        Ok(Some(name))
    }

    /// Remove a chat with all its messages and attachments. A running turn is
    /// cancelled first.
    pub fn delete(&self, name: &str) -> Result<(), ChatError> {
        let mut sessions = self.sessions.write();
        let index = sessions
            .iter()
            .position(|s| s.lock().name() == name)
            .ok_or_else(|| ChatError::NotFound {
                name: name.to_string(),
            })?;

        let id = {
            let session = sessions[index].lock();
            session.stop();
            session.id().to_string()
        };
        self.store.delete_session(&id)?;
        sessions.remove(index);
        tracing::info!(session_id = %id, %name, "chat deleted");
        Ok(())
    }

    /// Take in a chat from outside the registry (a Quick Ask, another
    /// database) under a fresh id. The name is numbered if taken.
    pub fn adopt(&self, mut chat: StoredSession) -> Result<SharedSession, ChatError> {
        let mut sessions = self.sessions.write();
        let base = chat.name.trim();
        let base = if base.is_empty() { DEFAULT_CHAT_NAME } else { base };
        chat.name = unique_name(base, |candidate| name_taken(&sessions, candidate));
        chat.id = generate_id();
        chat.messages = chat.messages.iter().map(|m| m.duplicate()).collect();

        self.store.insert_session_with_messages(&chat)?;
        tracing::info!(session_id = %chat.id, name = %chat.name, messages = chat.messages.len(), "chat adopted");

        let session = ChatSession::from_stored(chat).into_shared();
        sessions.insert(0, session.clone());
        Ok(session)
    }

    /// Deep copy into a new idle chat named `"Copy of {name}"`, numbered if taken.
    pub fn duplicate(&self, name: &str) -> Result<SharedSession, ChatError> {
        let mut sessions = self.sessions.write();
        let source = find_by_name(&sessions, name).ok_or_else(|| ChatError::NotFound {
            name: name.to_string(),
        })?;

        let mut copy = source.lock().to_stored();
        copy.id = generate_id();
        copy.name = unique_name(&format!("Copy of {}", name), |candidate| {
            name_taken(&sessions, candidate)
        });
        copy.messages = copy.messages.iter().map(|m| m.duplicate()).collect();

        self.store.insert_session_with_messages(&copy)?;
        tracing::info!(session_id = %copy.id, name = %copy.name, "chat duplicated");

        let session = ChatSession::from_stored(copy).into_shared();
        let position = sessions
            .iter()
            .position(|s| Arc::ptr_eq(s, &source))
            .unwrap_or(0);
        sessions.insert(position, session.clone());
        Ok(session)
    }
}

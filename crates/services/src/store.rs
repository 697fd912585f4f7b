//! Persistence collaborator for chats, messages and attachments.
//!
//! The chat core issues exactly one call per state transition (message append,
//! finalize, rename, delete, duplicate); implementations decide how to store it.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use shared::message::Message;

/// A chat as read back from storage, messages in insertion order
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub id: String,
    pub name: String,
    pub messages: Vec<Message>,
}

impl StoredSession {
    fn last_activity(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.messages.iter().map(|m| m.created_at).max()
    }
}

/// Record store keyed by session, message and attachment id
pub trait ChatStore: Send + Sync {
    fn insert_session(&self, id: &str, name: &str) -> Result<()>;

    /// Insert a chat together with all its messages and attachments.
    fn insert_session_with_messages(&self, session: &StoredSession) -> Result<()>;

    fn rename_session(&self, id: &str, name: &str) -> Result<()>;

    /// Remove a chat and, with it, every message and attachment it owns.
    fn delete_session(&self, id: &str) -> Result<()>;

    /// Append a message (and its attachments) to the end of a chat.
    fn insert_message(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Overwrite content and timestamps of an existing message.
    fn update_message(&self, message: &Message) -> Result<()>;

    /// Remove one message and its attachments.
    fn delete_message(&self, message_id: &str) -> Result<()>;

    /// Every chat, most recently active first.
    fn load_sessions(&self) -> Result<Vec<StoredSession>>;
}

/// In-process store. Nothing survives a restart; used for one-off chats and tests.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<Vec<StoredSession>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write calls so far.
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }

    pub fn session(&self, id: &str) -> Option<StoredSession> {
        self.sessions.lock().iter().find(|s| s.id == id).cloned()
    }

    fn record_write(&self) {
        *self.writes.lock() += 1;
    }
}

impl ChatStore for MemoryStore {
    fn insert_session(&self, id: &str, name: &str) -> Result<()> {
        self.insert_session_with_messages(&StoredSession {
            id: id.to_string(),
            name: name.to_string(),
            messages: Vec::new(),
        })
    }

    fn insert_session_with_messages(&self, session: &StoredSession) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.iter().any(|s| s.id == session.id) {
            return Err(anyhow!("chat {} already stored", session.id));
        }
        sessions.push(session.clone());
        drop(sessions);
        self.record_write();
        Ok(())
    }

    fn rename_session(&self, id: &str, name: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("chat {} not stored", id))?;
        session.name = name.to_string();
        drop(sessions);
        self.record_write();
        Ok(())
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        self.sessions.lock().retain(|s| s.id != id);
        self.record_write();
        Ok(())
    }

    fn insert_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| anyhow!("chat {} not stored", session_id))?;
        session.messages.push(message.clone());
        drop(sessions);
        self.record_write();
        Ok(())
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let stored = sessions
            .iter_mut()
            .flat_map(|s| s.messages.iter_mut())
            .find(|m| m.id == message.id)
            .ok_or_else(|| anyhow!("message {} not stored", message.id))?;
        stored.content = message.content.clone();
        stored.finished_at = message.finished_at;
        drop(sessions);
        self.record_write();
        Ok(())
    }

    fn delete_message(&self, message_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.messages.iter().any(|m| m.id == message_id))
            .ok_or_else(|| anyhow!("message {} not stored", message_id))?;
        session.messages.retain(|m| m.id != message_id);
        drop(sessions);
        self.record_write();
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut sessions = self.sessions.lock().clone();
        sessions.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        Ok(sessions)
    }
}

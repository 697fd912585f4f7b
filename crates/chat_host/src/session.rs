//! One conversation thread and its Idle/Busy state machine.

use chrono::Utc;
use futures::future::{AbortHandle, AbortRegistration};
use parking_lot::Mutex;
use regex::RegexBuilder;
use shared::agent_api::WireMessage;
use shared::message::{Attachment, Message, Role};
use shared::naming::is_placeholder_name;
use shared::ChatError;
use std::sync::Arc;

use services::StoredSession;

/// A session shared between the registry and the task streaming into it.
/// The lock is only ever held for short, non-awaiting sections.
pub type SharedSession = Arc<Mutex<ChatSession>>;

/// Busy and the streaming reference are one value, so they can't disagree.
#[derive(Debug)]
pub enum SessionState {
    Idle,
    Busy {
        /// The assistant message being streamed into
        message_id: String,
        abort: AbortHandle,
    },
}

/// Everything the runner needs to carry out one user turn
#[derive(Debug)]
pub struct PendingTurn {
    pub session_id: String,
    /// None when regenerating an existing reply
    pub user: Option<Message>,
    pub assistant: Message,
    /// Id of the reply being regenerated
    pub replaces: Option<String>,
    pub model: String,
    /// History the reply is generated from
    pub messages: Vec<WireMessage>,
    pub registration: AbortRegistration,
    /// No assistant reply existed before this turn
    pub first_reply: bool,
}

#[derive(Debug)]
pub struct ChatSession {
    id: String,
    name: String,
    previous_name: Option<String>,
    messages: Vec<Message>,
    state: SessionState,
    title_requested: bool,
}

fn required_model(model: Option<&str>) -> Result<String, ChatError> {
    match model.map(str::trim) {
        Some(model) if !model.is_empty() => Ok(model.to_string()),
        _ => Err(ChatError::MissingModel),
    }
}

impl ChatSession {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            previous_name: None,
            messages: Vec::new(),
            state: SessionState::Idle,
            title_requested: false,
        }
    }

    pub fn from_stored(stored: StoredSession) -> Self {
        Self {
            messages: stored.messages,
            ..Self::new(stored.id, stored.name)
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        let old = std::mem::replace(&mut self.name, name.into());
        self.previous_name = Some(old);
    }

    /// Name before the last rename.
    pub(crate) fn previous_name(&self) -> Option<&str> {
        self.previous_name.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, SessionState::Busy { .. })
    }

    /// Id of the assistant message currently streaming, if any.
    pub fn streaming_message_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Busy { message_id, .. } => Some(message_id),
            SessionState::Idle => None,
        }
    }

    fn busy_error(&self) -> ChatError {
        ChatError::Busy {
            session: self.name.clone(),
        }
    }

    /// Append an empty message. User and system messages are refused while busy;
    /// assistant messages need a model name.
    pub fn add_message(&mut self, role: Role, model: Option<&str>) -> Result<Message, ChatError> {
        let model = match role {
            Role::Assistant => match model.map(str::trim) {
                Some(model) if !model.is_empty() => Some(model.to_string()),
                _ => return Err(ChatError::MissingModel),
            },
            Role::User | Role::System => {
                if self.is_busy() {
                    return Err(self.busy_error());
                }
                None
            }
        };
        let message = Message::new(role, model);
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Validate and record a user turn, moving the session to `Busy`.
    ///
    /// Nothing is mutated when an error is returned.
    pub fn send_user_message(
        &mut self,
        text: &str,
        attachments: Vec<Attachment>,
        model: Option<&str>,
    ) -> Result<PendingTurn, ChatError> {
        if self.is_busy() {
            return Err(self.busy_error());
        }
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        let model = required_model(model)?;

        let mut user = Message::new(Role::User, None);
        user.content = text.to_string();
        for attachment in attachments {
            user.add_attachment(attachment);
        }
        user.finished_at = Some(user.created_at);
        self.messages.push(user.clone());

        Ok(self.begin_reply(model, Some(user), None))
    }

    /// Drop the trailing assistant reply and stream a new one from the same
    /// history, moving the session to `Busy`.
    ///
    /// Nothing is mutated when an error is returned.
    pub fn regenerate(&mut self, model: Option<&str>) -> Result<PendingTurn, ChatError> {
        if self.is_busy() {
            return Err(self.busy_error());
        }
        if !matches!(self.messages.last(), Some(m) if m.role == Role::Assistant) {
            return Err(ChatError::NoReply);
        }
        let model = required_model(model)?;

        let replaced = self.messages.pop().map(|m| m.id);
        Ok(self.begin_reply(model, None, replaced))
    }

    fn begin_reply(&mut self, model: String, user: Option<Message>, replaces: Option<String>) -> PendingTurn {
        let first_reply = !self.messages.iter().any(|m| m.role == Role::Assistant);
        let messages = self.to_wire_format();

        let assistant = Message::new(Role::Assistant, Some(model.clone()));
        self.messages.push(assistant.clone());

        let (abort, registration) = AbortHandle::new_pair();
        self.state = SessionState::Busy {
            message_id: assistant.id.clone(),
            abort,
        };

        PendingTurn {
            session_id: self.id.clone(),
            user,
            assistant,
            replaces,
            model,
            messages,
            registration,
            first_reply,
        }
    }

    /// Append a finished system message. The backend is not contacted.
    pub fn send_system_message(&mut self, text: &str) -> Result<Message, ChatError> {
        if self.is_busy() {
            return Err(self.busy_error());
        }
        if text.trim().is_empty() {
            return Err(ChatError::EmptyInput);
        }
        let mut message = Message::new(Role::System, None);
        message.content = text.to_string();
        message.finished_at = Some(message.created_at);
        self.messages.push(message.clone());
        Ok(message)
    }

    pub fn to_wire_format(&self) -> Vec<WireMessage> {
        self.messages.iter().map(Message::to_wire).collect()
    }

    /// Ask the running turn to cancel. The session stays `Busy` until the runner
    /// acknowledges by finalizing the partial reply. Returns false when idle.
    pub fn stop(&self) -> bool {
        match &self.state {
            SessionState::Busy { abort, message_id } => {
                tracing::debug!(session_id = %self.id, %message_id, "cancelling turn");
                abort.abort();
                true
            }
            SessionState::Idle => false,
        }
    }

    /// Append streamed content to the message currently being generated.
    /// Returns false if `message_id` is not the streaming message.
    pub fn append_chunk(&mut self, message_id: &str, content: &str) -> bool {
        if self.streaming_message_id() != Some(message_id) {
            return false;
        }
        match self.messages.iter_mut().rev().find(|m| m.id == message_id) {
            Some(message) => {
                message.content.push_str(content);
                true
            }
            None => false,
        }
    }

    /// Freeze the streaming message and return to `Idle`.
    pub fn finish_turn(&mut self, message_id: &str) -> Option<Message> {
        if self.streaming_message_id() != Some(message_id) {
            return None;
        }
        self.state = SessionState::Idle;
        let message = self.messages.iter_mut().rev().find(|m| m.id == message_id)?;
        message.finished_at = Some(Utc::now());
        Some(message.clone())
    }

    /// Reserve the one title generation this session may get.
    pub(crate) fn claim_title(&mut self) -> bool {
        if self.title_requested || !is_placeholder_name(&self.name) {
            return false;
        }
        self.title_requested = true;
        true
    }

    /// Case-insensitive search over message text. A pattern that is not a valid
    /// regular expression is matched literally.
    pub fn search(&self, pattern: &str) -> Vec<Message> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                RegexBuilder::new(&regex::escape(pattern))
                    .case_insensitive(true)
                    .build()
            });
        let Ok(regex) = regex else {
            return Vec::new();
        };
        self.messages
            .iter()
            .filter(|m| regex.is_match(&m.content))
            .cloned()
            .collect()
    }

    /// Snapshot for storage. An in-flight reply is left out.
    pub fn to_stored(&self) -> StoredSession {
        let streaming = self.streaming_message_id();
        StoredSession {
            id: self.id.clone(),
            name: self.name.clone(),
            messages: self
                .messages
                .iter()
                .filter(|m| Some(m.id.as_str()) != streaming)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::message::AttachmentKind;

    fn session() -> ChatSession {
        ChatSession::new("s1", "New Chat")
    }

    #[test]
    fn test_send_moves_to_busy() {
        let mut chat = session();
        let turn = chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();

        assert!(chat.is_busy());
        assert_eq!(chat.streaming_message_id(), Some(turn.assistant.id.as_str()));
        assert_eq!(chat.messages().len(), 2);
        assert_eq!(turn.messages.len(), 1);
        assert_eq!(turn.messages[0].content, "Hi");
        assert_eq!(turn.assistant.model.as_deref(), Some("m1"));
        assert!(turn.first_reply);
    }

    #[test]
    fn test_busy_rejects_without_mutation() {
        let mut chat = session();
        chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();
        let before = chat.messages().to_vec();

        let err = chat.send_user_message("Again", Vec::new(), Some("m1")).unwrap_err();
        assert!(matches!(err, ChatError::Busy { .. }));
        assert!(matches!(
            chat.send_system_message("Be brief"),
            Err(ChatError::Busy { .. })
        ));
        assert!(matches!(
            chat.add_message(Role::User, None),
            Err(ChatError::Busy { .. })
        ));
        assert_eq!(chat.messages(), before.as_slice());
    }

    #[test]
    fn test_validation_errors() {
        let mut chat = session();
        assert!(matches!(
            chat.send_user_message("   ", Vec::new(), Some("m1")),
            Err(ChatError::EmptyInput)
        ));
        assert!(matches!(
            chat.send_user_message("Hi", Vec::new(), None),
            Err(ChatError::MissingModel)
        ));
        assert!(matches!(
            chat.add_message(Role::Assistant, Some(" ")),
            Err(ChatError::MissingModel)
        ));
        assert!(chat.messages().is_empty());
        assert!(!chat.is_busy());
    }

    #[test]
    fn test_attachment_only_message_is_accepted() {
        let mut chat = session();
        let notes = Attachment::text(AttachmentKind::PlainText, "notes.txt", "a");
        let again = Attachment::text(AttachmentKind::PlainText, "notes.txt", "b");
        let turn = chat
            .send_user_message("", vec![notes, again], Some("m1"))
            .unwrap();

        let names: Vec<_> = turn.user.as_ref().unwrap().attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt", "notes 2.txt"]);
    }

    #[test]
    fn test_chunks_and_finish() {
        let mut chat = session();
        let turn = chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();
        let id = turn.assistant.id.clone();

        assert!(chat.append_chunk(&id, "He"));
        assert!(chat.append_chunk(&id, "llo"));
        assert!(!chat.append_chunk("other", "x"));

        let finished = chat.finish_turn(&id).unwrap();
        assert_eq!(finished.content, "Hello");
        assert!(finished.is_finalized());
        assert!(!chat.is_busy());
        assert!(!chat.append_chunk(&id, "late"));
        assert!(chat.finish_turn(&id).is_none());
    }

    #[test]
    fn test_regenerate_replaces_last_reply() {
        let mut chat = session();
        assert!(matches!(chat.regenerate(Some("m1")), Err(ChatError::NoReply)));

        let turn = chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();
        chat.append_chunk(&turn.assistant.id, "Hel");
        chat.finish_turn(&turn.assistant.id).unwrap();

        let again = chat.regenerate(Some("m2")).unwrap();
        assert!(chat.is_busy());
        assert!(again.user.is_none());
        assert_eq!(again.replaces.as_deref(), Some(turn.assistant.id.as_str()));
        assert!(again.first_reply);
        assert_eq!(again.messages.len(), 1);
        assert_eq!(again.messages[0].content, "Hi");

        let roles: Vec<_> = chat.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(chat.messages()[1].id, again.assistant.id);
        assert_eq!(chat.messages()[1].content, "");
        assert!(matches!(chat.regenerate(Some("m1")), Err(ChatError::Busy { .. })));
    }

    #[test]
    fn test_regenerate_needs_trailing_reply_and_model() {
        let mut chat = session();
        let turn = chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();
        chat.finish_turn(&turn.assistant.id).unwrap();
        let before = chat.messages().to_vec();

        assert!(matches!(chat.regenerate(None), Err(ChatError::MissingModel)));
        assert_eq!(chat.messages(), before.as_slice());

        chat.send_system_message("Be brief").unwrap();
        assert!(matches!(chat.regenerate(Some("m1")), Err(ChatError::NoReply)));
    }

    #[test]
    fn test_stop_signals_abort() {
        let mut chat = session();
        assert!(!chat.stop());
        let turn = chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();
        let registration = turn.registration;

        assert!(chat.stop());
        assert!(chat.is_busy());

        let aborted = futures::executor::block_on(futures::future::Abortable::new(
            futures::future::pending::<()>(),
            registration,
        ));
        assert!(aborted.is_err());
    }

    #[test]
    fn test_system_message_and_wire_order() {
        let mut chat = session();
        chat.send_system_message("Be brief").unwrap();
        let turn = chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();

        let roles: Vec<_> = turn.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
        assert_eq!(chat.to_wire_format().len(), 3);
    }

    #[test]
    fn test_search_is_case_insensitive_and_tolerant() {
        let mut chat = session();
        chat.send_system_message("Rust (the language)").unwrap();
        chat.send_system_message("rusty nails").unwrap();

        assert_eq!(chat.search("RUST").len(), 2);
        assert_eq!(chat.search("^rust ").len(), 1);
        assert_eq!(chat.search("(the").len(), 1);
    }

    #[test]
    fn test_title_claimed_once_for_placeholder() {
        let mut chat = session();
        assert!(chat.claim_title());
        assert!(!chat.claim_title());

        let mut named = ChatSession::new("s2", "Work");
        assert!(!named.claim_title());
    }

    #[test]
    fn test_stored_snapshot_skips_streaming_reply() {
        let mut chat = session();
        chat.send_user_message("Hi", Vec::new(), Some("m1")).unwrap();
        let stored = chat.to_stored();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].role, Role::User);
    }
}

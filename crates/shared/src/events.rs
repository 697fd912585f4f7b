//! Events emitted while a chat turn is running.
//!
//! The runner publishes these on an unbounded channel; callers subscribe and
//! never hand callbacks into the core.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// How a turn that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnOutcome {
    /// Backend reported `done` or closed the stream cleanly
    Completed,
    /// Stopped by the caller; content is whatever had arrived
    Cancelled,
}

/// Real-time session updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A user message was appended and the assistant reply is pending
    TurnStarted {
        session_id: String,
        message_id: String,
    },
    /// Incremental assistant content
    Chunk {
        session_id: String,
        message_id: String,
        content: String,
    },
    /// Assistant message finalized
    TurnFinished {
        session_id: String,
        message: Message,
        outcome: TurnOutcome,
    },
    /// Transport failure; `message` holds the partial reply
    TurnFailed {
        session_id: String,
        message: Message,
        error: String,
    },
    /// Background title generation renamed the chat
    TitleGenerated { session_id: String, title: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::TurnStarted { session_id, .. } => session_id,
            SessionEvent::Chunk { session_id, .. } => session_id,
            SessionEvent::TurnFinished { session_id, .. } => session_id,
            SessionEvent::TurnFailed { session_id, .. } => session_id,
            SessionEvent::TitleGenerated { session_id, .. } => session_id,
        }
    }

    /// True for the event that closes a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::TurnFinished { .. } | SessionEvent::TurnFailed { .. }
        )
    }
}

//! Chat Host - streaming chat sessions on top of an inference backend
//!
//! This crate provides:
//! - Chat sessions with an Idle/Busy state machine
//! - A runner that streams replies into sessions and finalizes them
//! - A registry keeping chat names unique, backed by a `ChatStore`
//! - Background title generation for freshly started chats

pub mod host;
pub mod registry;
pub mod runner;
pub mod session;
pub mod title;

#[cfg(test)]
mod testing;

pub use host::{ChatHost, ExportFormat, TurnHandle};
pub use registry::{SessionRegistry, SessionSummary};
pub use runner::{FinishedTurn, StreamRunner};
pub use session::{ChatSession, PendingTurn, SessionState, SharedSession};
pub use title::{clean_title, TitleGenerator};

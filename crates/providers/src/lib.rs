//! Backend plumbing: the Ollama wire format, the shared HTTP connection, and the
//! local backend process with its idle timeout.

pub mod connection;
pub mod idle;
pub mod instance;
pub mod ndjson;
pub mod ollama;
#[cfg(all(test, unix))]
mod testing;

pub use connection::{BackendConnection, BackendMode, BackendResponse};
pub use ollama::{ChatBackend, ChatChunk, ChatRequest};

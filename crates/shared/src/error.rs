//! Error taxonomy for the chat core.

/// Errors surfaced by sessions, the registry and the backend connection
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Local backend process could not be launched
    #[error("Backend failed to start: {reason}")]
    Startup { reason: String },

    /// Transport failure, timeout or non-2xx status
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Chat '{session}' is busy")]
    Busy { session: String },

    #[error("Message is empty")]
    EmptyInput,

    #[error("A chat named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Chat not found: {name}")]
    NotFound { name: String },

    #[error("No model selected")]
    MissingModel,

    /// Regenerate needs an assistant reply at the end of the chat
    #[error("Nothing to regenerate")]
    NoReply,

    #[error("Storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn startup(reason: impl Into<String>) -> Self {
        ChatError::Startup {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        ChatError::Network {
            reason: reason.into(),
        }
    }

    /// Validation errors are rejected synchronously and never leave the caller.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChatError::Busy { .. }
                | ChatError::EmptyInput
                | ChatError::DuplicateName { .. }
                | ChatError::MissingModel
                | ChatError::NoReply
        )
    }
}

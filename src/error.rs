// Error taxonomy for the conversation sync core

use thiserror::Error;

/// Errors produced by the sync core and its backend adapters.
///
/// Every variant is recoverable: fetch errors become a retryable flag on the
/// view, dispatch errors become a `failed` status on a single message.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Initial load of a conversation failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Persistent store rejected a write
    #[error("Store error: {0}")]
    Store(String),

    /// Network or transport failure talking to the backend
    #[error("Transport error: {0}")]
    Transport(String),

    /// The messaging provider refused the message
    #[error("Rejected by provider [{}]: {message}", .code.as_deref().unwrap_or("no code"))]
    Rejected {
        code: Option<String>,
        message: String,
    },

    /// Live change feed could not be opened
    #[error("Change feed error: {0}")]
    Feed(String),

    /// A row from the backend could not be turned into a message
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("No contact context for conversation {0}")]
    NoContact(String),

    #[error("Message has no content")]
    EmptyMessage,

    #[error("Configuration error: {0}")]
    Config(String),

    /// The sync worker is no longer running
    #[error("Sync engine stopped")]
    EngineStopped,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

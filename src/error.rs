//! Error taxonomy for the scoring and notification pipeline.
//!
//! - `NotFound` is fatal to the single operation that raised it.
//! - `Configuration` disables one channel, never a whole notification.
//! - `Transport` is retried by the channel queue, then recorded as terminal.
//! - `Protocol` means the provider accepted a send but its reply was
//!   unreadable. Never retried, since the message may already be out.
//! - `Validation` is recovered from by substituting defaults.

use thiserror::Error;
use uuid::Uuid;

use crate::models::Channel;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("{0} channel is not configured")]
    Configuration(Channel),

    #[error("transport rejected send: {0}")]
    Transport(String),

    #[error("unreadable provider response: {0}")]
    Protocol(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode document: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Error::NotFound { kind, id }
    }

    /// Returns true if a channel queue should try the send again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

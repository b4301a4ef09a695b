// Errors returned by the lock session and its components.

use folio_common::protocol::ProtocolError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("conflict `{0}` not found")]
    ConflictNotFound(String),

    #[error("optimistic operation `{0}` is not pending")]
    UnknownOperation(Uuid),

    #[error("realtime channel is not connected")]
    NotConnected,

    #[error("lock session is closed")]
    Closed,

    /// The transport refused the request before it reached the server.
    #[error("transport rejected {what}: {message}")]
    Transport { what: String, message: String },

    #[error("resolution for conflict `{conflict_id}` was not accepted: {message}")]
    Submission { conflict_id: String, message: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("offline storage failed: {0:#}")]
    Storage(anyhow::Error),
}

impl SyncError {
    pub(crate) fn transport(what: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::Transport { what: what.into(), message: format!("{error:#}") }
    }
}

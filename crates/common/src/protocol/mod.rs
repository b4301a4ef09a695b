// Wire protocol for the lock sync subsystem.

pub mod api;
pub mod channel;

pub const CURRENT_PROTOCOL_VERSION: &str = "folio-locks.v1";

/// Errors raised while decoding or encoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed channel name `{0}`: expected `<channel>:<projectId>`")]
    MalformedChannel(String),

    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("message for project `{actual}` delivered to session for `{expected}`")]
    ProjectMismatch { expected: String, actual: String },

    #[error("channel `{0}` is not valid in this direction")]
    WrongDirection(String),

    #[error("invalid payload on channel `{channel}`: {source}")]
    InvalidPayload {
        channel: String,
        #[source]
        source: serde_json::Error,
    },
}

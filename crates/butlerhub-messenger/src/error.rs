use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur within any channel adapter.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed delivery row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("delivery request not found: {0}")]
    NotFound(Uuid),

    #[error("no channel adapter registered for {0:?}")]
    UnknownChannel(String),

    #[error("unrecognized stored variant: {0}")]
    UnknownVariant(String),

    #[error("delivery_request row for {0:?} vanished immediately after insert")]
    Inconsistent(String),

    #[error("origin_butler {expected:?} does not match authenticated caller {actual:?}")]
    OriginMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, MessengerError>;

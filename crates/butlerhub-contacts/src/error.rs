use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContactError {
    #[error("contact not found: {0}")]
    NotFound(Uuid),

    #[error("channel already bound to a contact: {channel_type}:{channel_value}")]
    ChannelAlreadyBound {
        channel_type: String,
        channel_value: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed contact row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

pub type Result<T> = std::result::Result<T, ContactError>;

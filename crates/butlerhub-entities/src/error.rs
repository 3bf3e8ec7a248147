use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed entity row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("entity not found: {0}")]
    NotFound(Uuid),

    #[error("cannot merge an entity into itself: {0}")]
    SelfMerge(Uuid),
}

pub type Result<T> = std::result::Result<T, EntityError>;

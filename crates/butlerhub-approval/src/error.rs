use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed approval row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("pending action not found: {id}")]
    ActionNotFound { id: Uuid },

    /// A second decider lost the CAS race on `pending → approved/rejected`.
    #[error("action {id} is no longer pending (concurrent decision)")]
    StateConflict { id: Uuid },

    #[error("action {id} is not in a decidable state")]
    NotDecidable { id: Uuid },

    #[error("unknown approval event type: {0}")]
    UnknownEventType(String),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

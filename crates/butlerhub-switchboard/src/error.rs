use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown variant: {0}")]
    UnknownVariant(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;

impl From<SwitchboardError> for butlerhub_core::ButlerError {
    fn from(err: SwitchboardError) -> Self {
        match err {
            SwitchboardError::Validation(msg) => butlerhub_core::ButlerError::Validation(msg),
            SwitchboardError::NotFound(msg) => butlerhub_core::ButlerError::NotFound(msg),
            SwitchboardError::UnknownVariant(msg) => {
                butlerhub_core::ButlerError::Internal(format!("unknown variant: {msg}"))
            }
            SwitchboardError::Database(e) => butlerhub_core::ButlerError::Database(
                butlerhub_core::error::rusqlite_compat::RusqliteError(e.to_string()),
            ),
            SwitchboardError::Serialization(e) => butlerhub_core::ButlerError::Serialization(e),
        }
    }
}

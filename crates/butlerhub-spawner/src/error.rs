use thiserror::Error;

/// Errors that can occur while spawning and running one agent turn.
#[derive(Debug, Error)]
pub enum SpawnerError {
    /// The agent runtime itself failed (provider error, tool loop error, …).
    #[error("agent runtime failed: {0}")]
    RuntimeFailed(String),

    /// Recording the session row failed.
    #[error("session store error: {0}")]
    SessionStore(#[from] butlerhub_sessions::SessionError),

    /// The turn was cancelled before the runtime produced an outcome.
    #[error("turn cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SpawnerError>;

use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The stored `tool_calls`/cron/args column failed to parse.
    #[error("malformed scheduled_tasks row: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The cron expression could not be parsed.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    /// No scheduled task with the given ID exists.
    #[error("scheduled task not found: {id}")]
    TaskNotFound { id: String },

    /// A stored `dispatch_mode` column held a value outside `{prompt, job}`.
    #[error("invalid dispatch_mode: {0}")]
    InvalidDispatchMode(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The wire-level error classes carried in every `route.v1`/`notify.v1`
/// response envelope as `{class, message, retryable}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ValidationError,
    NotFound,
    StateConflict,
    Duplicate,
    Unavailable,
    InternalError,
    RateLimited,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ValidationError => "validation_error",
            ErrorClass::NotFound => "not_found",
            ErrorClass::StateConflict => "state_conflict",
            ErrorClass::Duplicate => "duplicate",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::InternalError => "internal_error",
            ErrorClass::RateLimited => "rate_limited",
        }
    }
}

/// Top-level error type shared across every butler crate. Each variant maps
/// to exactly one [`ErrorClass`] and carries the `retryable` bit every
/// error envelope exposes — never retried for `ValidationError`, always
/// non-retryable for `NotFound`/`StateConflict`/`Duplicate`.
#[derive(Debug, Error)]
pub enum ButlerError {
    /// Envelope shape, untrusted caller, inconsistent origin. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown entity, action, rule, or node.
    #[error("not found: {0}")]
    NotFound(String),

    /// CAS loss on an approval/delivery transition, or re-enabling a failed module.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Idempotency-key match in a non-terminal state for delivery.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// DB connection lost, provider temporarily down, or butler stale/quarantined.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected exception; message is sanitized before it reaches a caller.
    #[error("internal error: {0}")]
    Internal(String),

    /// Provider returned 429; `retry_after_secs` echoes `Retry-After` when known.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite_compat::RusqliteError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Thin wrapper so `butlerhub-core` doesn't need a hard dependency on
/// `rusqlite` just to implement `From` for its error type; storage crates
/// convert their `rusqlite::Error` into this newtype at the boundary.
pub mod rusqlite_compat {
    use std::fmt;

    #[derive(Debug)]
    pub struct RusqliteError(pub String);

    impl fmt::Display for RusqliteError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for RusqliteError {}
}

impl ButlerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ButlerError::Validation(_) => ErrorClass::ValidationError,
            ButlerError::NotFound(_) => ErrorClass::NotFound,
            ButlerError::StateConflict(_) => ErrorClass::StateConflict,
            ButlerError::Duplicate(_) => ErrorClass::Duplicate,
            ButlerError::Unavailable(_) => ErrorClass::Unavailable,
            ButlerError::Internal(_) => ErrorClass::InternalError,
            ButlerError::RateLimited { .. } => ErrorClass::RateLimited,
            ButlerError::Serialization(_) => ErrorClass::InternalError,
            ButlerError::Database(_) => ErrorClass::Unavailable,
            ButlerError::Io(_) => ErrorClass::Unavailable,
        }
    }

    /// Whether a connector/caller may retry this error. Only `unavailable`
    /// and `rate_limited` are retryable per the error taxonomy.
    pub fn retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Unavailable | ErrorClass::RateLimited
        )
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            class: self.class().as_str().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

/// Wire representation of a failure, embedded in `route_response.v1` and
/// `notify_response.v1` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub class: String,
    pub message: String,
    pub retryable: bool,
}

pub type Result<T> = std::result::Result<T, ButlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_never_retryable() {
        let err = ButlerError::Validation("bad envelope".to_string());
        assert!(!err.retryable());
        assert_eq!(err.class().as_str(), "validation_error");
    }

    #[test]
    fn unavailable_and_rate_limited_are_retryable() {
        assert!(ButlerError::Unavailable("db down".into()).retryable());
        assert!(ButlerError::RateLimited {
            retry_after_secs: Some(30)
        }
        .retryable());
    }

    #[test]
    fn envelope_round_trips_class_string() {
        let err = ButlerError::NotFound("node".into());
        let env = err.to_envelope();
        assert_eq!(env.class, "not_found");
        assert!(!env.retryable);
    }
}

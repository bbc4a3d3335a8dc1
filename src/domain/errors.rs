//! Domain errors for the gathering orchestration core.

use thiserror::Error;

/// Classification of a [`CoreError`], used by callers that map errors to
/// transport-level codes (e.g. HTTP 409 for `Conflict`, 408 for `Timeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    NotAuthorized,
    Capacity,
    Timeout,
    Conflict,
    External,
    BadInput,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::NotAuthorized => "not_authorized",
            Self::Capacity => "capacity",
            Self::Timeout => "timeout",
            Self::Conflict => "conflict",
            Self::External => "external",
            Self::BadInput => "bad_input",
        }
    }
}

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A referenced task, agent, conversation, or action is missing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A state transition is not legal from the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller is not the task holder or designated reviewer.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Worker pool full, component draining, or circle not running.
    #[error("capacity: {0}")]
    Capacity(String),

    /// A deadline was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A concurrent update lost a compare-and-set race. May be retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A store, skill, or provider call failed.
    #[error("external failure: {0}")]
    External(String),

    /// Malformed input: bad cron expression, unknown strategy, empty field.
    #[error("bad input: {0}")]
    BadInput(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotAuthorized(_) => ErrorKind::NotAuthorized,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::External(_) => ErrorKind::External,
            Self::BadInput(_) => ErrorKind::BadInput,
        }
    }

    /// Whether the operation may be retried locally (lost CAS races only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::External(format!("store: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::External(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        let err = CoreError::not_found("task", 42);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.kind().as_str(), "not_found");
        assert_eq!(err.to_string(), "task not found: 42");

        assert_eq!(CoreError::Conflict("cas".into()).kind(), ErrorKind::Conflict);
        assert_eq!(CoreError::BadInput("cron".into()).kind(), ErrorKind::BadInput);
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(CoreError::Conflict("lost race".into()).is_retryable());
        assert!(!CoreError::Timeout("deadline".into()).is_retryable());
        assert!(!CoreError::External("store".into()).is_retryable());
    }
}

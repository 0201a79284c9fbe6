//! Metering error types

use thiserror::Error;

/// Errors surfaced by the metering engine
///
/// `NotFound`, `InvalidArgument` and `LimitExceeded` are terminal for the
/// caller. `Unavailable` is retried internally only for read-only allowance
/// checks; mutating operations are left to the caller to retry, which is safe
/// because they are idempotent on correlation id.
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Reservation expired: {0}")]
    Expired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl MeteringError {
    /// Whether a caller-side retry can possibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }
}

impl From<sqlx::Error> for MeteringError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Unavailable(err.to_string())
            }
            sqlx::Error::Io(_) => Self::Unavailable(err.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

pub type MeteringResult<T> = Result<T, MeteringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!MeteringError::NotFound("org".into()).is_retryable());
        assert!(!MeteringError::InvalidArgument("amount".into()).is_retryable());
        assert!(!MeteringError::LimitExceeded("cap".into()).is_retryable());
        assert!(!MeteringError::Expired("hold".into()).is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(MeteringError::Unavailable("pool".into()).is_retryable());
    }
}

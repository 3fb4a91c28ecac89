//! Shared primitives for all Rust crates in Fanout.

#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across Fanout crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for NonEmptyString {
    type Error = AppError;

    fn try_from(value: String) -> AppResult<Self> {
        Self::new(value)
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl Display for NonEmptyString {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated attribute constraint.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A distributed lock could not be acquired or released.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// Every assignment of the workload has been committed.
    ///
    /// This is the completion signal of assignment polling, not a failure.
    #[error("workload fulfilled: {0}")]
    WorkloadFulfilled(String),

    /// A programming contract was broken, such as committing past the
    /// expected assignment count.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The caller cancelled the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Internal unexpected error, including storage and connectivity failures.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns whether a caller loop may retry the failed operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockUnavailable(_) | Self::Internal(_))
    }

    /// Returns whether the error is the workload completion signal.
    #[must_use]
    pub fn is_workload_fulfilled(&self) -> bool {
        matches!(self, Self::WorkloadFulfilled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{AppError, NonEmptyString};

    #[test]
    fn non_empty_string_rejects_whitespace() {
        let result = NonEmptyString::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn non_empty_string_try_from_rejects_empty() {
        let result = NonEmptyString::try_from(String::new());
        assert!(result.is_err());
    }

    #[test]
    fn only_contention_and_storage_errors_are_retryable() {
        assert!(AppError::LockUnavailable("busy".to_owned()).is_retryable());
        assert!(AppError::Internal("connection reset".to_owned()).is_retryable());
        assert!(!AppError::Validation("bad".to_owned()).is_retryable());
        assert!(!AppError::WorkloadFulfilled("done".to_owned()).is_retryable());
        assert!(!AppError::InvariantViolation("overflow".to_owned()).is_retryable());
    }
}

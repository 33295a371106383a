//! Domain error model.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures raised while executing
/// commands against an aggregate. Storage and transport concerns belong to
/// the infrastructure error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// No handler is registered for the command name.
    #[error("unknown command '{command}' for model '{model}'")]
    UnknownCommand { model: String, command: String },

    /// No snapshot exists at or before the requested point in time.
    #[error("no snapshot at or before {at}")]
    NoSnapshot { at: DateTime<Utc> },

    /// A value failed validation (e.g. malformed payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The command was rejected by its handler for a business reason.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn unknown_command(model: impl Into<String>, command: impl Into<String>) -> Self {
        Self::UnknownCommand {
            model: model.into(),
            command: command.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Stable numeric code of this error.
    pub fn code(&self) -> u32 {
        match self {
            DomainError::UnknownCommand { .. } => 9002,
            DomainError::NoSnapshot { .. } => 9003,
            DomainError::Validation(_) => 9010,
            DomainError::InvariantViolation(_) => 9011,
            DomainError::Rejected(_) => 9012,
            DomainError::InvalidId(_) => 9013,
        }
    }

    /// Programmer errors that must surface immediately instead of being retried.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, DomainError::UnknownCommand { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_is_a_programmer_error_with_code_9002() {
        let err = DomainError::unknown_command("Customer", "onboard");

        assert_eq!(err.code(), 9002);
        assert!(err.is_programmer_error());
        assert_eq!(
            err.to_string(),
            "unknown command 'onboard' for model 'Customer'"
        );
    }

    #[test]
    fn rejections_are_not_programmer_errors() {
        assert!(!DomainError::rejected("already active").is_programmer_error());
    }
}

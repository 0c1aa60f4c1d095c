//! Domain error model.

use thiserror::Error;

/// Result type used for value validation.
pub type DomainResult<T> = Result<T, DomainError>;

/// Validation failure for values handed to the job storage.
///
/// Storage faults are not represented here; they belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. an empty resource or key).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Reject empty (or whitespace-only) names for locks, keys and queues.
pub fn ensure_not_blank(what: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{what} must not be empty")));
    }
    Ok(())
}

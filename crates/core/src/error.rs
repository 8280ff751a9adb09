//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Failures detectable from an observation alone, before storage is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed observation (empty reference, missing asset, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An entity disagrees with its own derived identity.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A wire code outside the known enumeration.
    #[error("{kind}: unknown code {code:?}")]
    UnknownCode { kind: &'static str, code: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_code(kind: &'static str, code: impl Into<String>) -> Self {
        Self::UnknownCode {
            kind,
            code: code.into(),
        }
    }
}

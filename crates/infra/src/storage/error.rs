//! Storage error taxonomy.
//!
//! SQLx errors are mapped to `StorageError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `DuplicateKey` |
//! | Database (foreign key violation) | `23503` | `ForeignKeyViolation` |
//! | Database (check / not-null violation) | `23514`, `23502` | `Validation` |
//! | Database (data exception) | `22xxx` | `Validation` |
//! | RowNotFound | N/A | `NotFound` |
//! | anything else | N/A | `Storage` |

use thiserror::Error;

use paystate_core::DomainError;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed input or filter.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key collision where uniqueness is a business rule.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Unknown connector/account/entity referenced. Aborts the whole batch.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Deadline elapsed or caller cancelled; the transaction was rolled back.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Wrapped driver error.
    #[error("storage failure in {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Backend-internal failure not coming from the driver.
    #[error("storage failure: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn foreign_key(msg: impl Into<String>) -> Self {
        Self::ForeignKeyViolation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<DomainError> for StorageError {
    fn from(err: DomainError) -> Self {
        StorageError::Validation(err.to_string())
    }
}

/// Map SQLx errors to `StorageError`.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(ref db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let code = db_err.code().map(|c| c.into_owned());
            match code.as_deref() {
                Some("23505") => StorageError::DuplicateKey(msg),
                Some("23503") => StorageError::ForeignKeyViolation(msg),
                Some("23514") | Some("23502") => StorageError::Validation(msg),
                Some(code) if code.starts_with("22") => StorageError::Validation(msg),
                _ => StorageError::Storage {
                    operation,
                    source: err,
                },
            }
        }
        sqlx::Error::RowNotFound => {
            StorageError::NotFound(format!("no row returned in {}", operation))
        }
        other => StorageError::Storage {
            operation,
            source: other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_validation() {
        let err: StorageError = DomainError::validation("bad reference").into();
        assert!(matches!(err, StorageError::Validation(msg) if msg.contains("bad reference")));

        let err: StorageError = DomainError::unknown_code("PaymentStatus", "SETTLED").into();
        assert!(matches!(err, StorageError::Validation(msg) if msg.contains("SETTLED")));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = map_sqlx_error("get_payment", sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::NotFound(msg) if msg.contains("get_payment")));
    }

    #[test]
    fn pool_errors_stay_wrapped() {
        let err = map_sqlx_error("begin", sqlx::Error::PoolClosed);
        assert!(matches!(err, StorageError::Storage { operation: "begin", .. }));
    }
}

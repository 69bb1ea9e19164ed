//! Store Error Types
//!
//! Every data-access failure is classified so callers can map it to a
//! response category without inspecting driver internals.

use thiserror::Error;

/// PostgreSQL SQLSTATE codes we classify.
/// See https://www.postgresql.org/docs/current/errcodes-appendix.html
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
pub const UNIQUE_VIOLATION: &str = "23505";
pub const CHECK_VIOLATION: &str = "23514";

/// Error returned by hooks running inside a transaction.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Broad error category, independent of the storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied invalid input; nothing was executed
    Validation,
    /// Referenced row does not exist
    NotFound,
    /// Unique / foreign key / check constraint rejected the write
    Constraint,
    /// Connection loss, pool exhaustion, timeout; safe to retry
    Transient,
    /// Anything else
    Internal,
}

/// Data access error
#[derive(Error, Debug)]
pub enum StoreError {
    // === Validation Errors ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Lookup Errors ===
    #[error("Record not found")]
    NotFound,

    // === Constraint Errors ===
    #[error("Constraint violation [{code}]: {message}")]
    ConstraintViolation {
        code: String,
        constraint: Option<String>,
        message: String,
    },

    // === Transaction Errors ===
    #[error("tx err: {tx}, rb err: {rollback}")]
    Rollback {
        tx: Box<StoreError>,
        rollback: Box<StoreError>,
    },

    #[error("After-create hook failed: {0}")]
    Hook(#[source] HookError),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Build a constraint violation carrying a SQLSTATE code
    pub fn constraint(code: &str, constraint: Option<&str>, message: impl Into<String>) -> Self {
        StoreError::ConstraintViolation {
            code: code.to_string(),
            constraint: constraint.map(str::to_string),
            message: message.into(),
        }
    }

    /// SQLSTATE code of the underlying failure, if any.
    ///
    /// A composite rollback error reports the code of the original failure.
    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::ConstraintViolation { code, .. } => Some(code),
            StoreError::Rollback { tx, .. } => tx.code(),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code() == Some(UNIQUE_VIOLATION)
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.code() == Some(FOREIGN_KEY_VIOLATION)
    }

    pub fn is_check_violation(&self) -> bool {
        self.code() == Some(CHECK_VIOLATION)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound => true,
            StoreError::Rollback { tx, .. } => tx.is_not_found(),
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidArgument(_) => ErrorKind::Validation,
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::ConstraintViolation { .. } => ErrorKind::Constraint,
            StoreError::Rollback { tx, .. } => tx.kind(),
            StoreError::Hook(_) => ErrorKind::Internal,
            StoreError::Unavailable(_) => ErrorKind::Transient,
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => ErrorKind::Transient,
                _ => ErrorKind::Internal,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get the error code for API responses
    pub fn api_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "INVALID_ARGUMENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Constraint if self.is_unique_violation() => "ALREADY_EXISTS",
            ErrorKind::Constraint => "CONSTRAINT_VIOLATION",
            ErrorKind::Transient => "UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Constraint if self.is_unique_violation() => 409,
            ErrorKind::Constraint => 422,
            ErrorKind::Transient => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            let code = db_err.code().map(|c| c.into_owned());
            if let Some(code) = code.filter(|c| {
                matches!(
                    c.as_str(),
                    UNIQUE_VIOLATION | FOREIGN_KEY_VIOLATION | CHECK_VIOLATION
                )
            }) {
                return StoreError::constraint(&code, db_err.constraint(), db_err.message());
            }
        }

        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_codes() {
        let err = StoreError::constraint(UNIQUE_VIOLATION, Some("users_pkey"), "duplicate key");
        assert!(err.is_unique_violation());
        assert!(!err.is_check_violation());
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert_eq!(err.api_code(), "ALREADY_EXISTS");
        assert_eq!(err.http_status(), 409);

        let err = StoreError::constraint(CHECK_VIOLATION, Some("accounts_balance_check"), "x");
        assert!(err.is_check_violation());
        assert_eq!(err.api_code(), "CONSTRAINT_VIOLATION");
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
        assert_eq!(err.api_code(), "UNAVAILABLE");
    }

    #[test]
    fn test_rollback_error_keeps_both_causes() {
        let err = StoreError::Rollback {
            tx: Box::new(StoreError::constraint(FOREIGN_KEY_VIOLATION, None, "fk")),
            rollback: Box::new(StoreError::Unavailable("connection reset".into())),
        };
        assert!(err.is_foreign_key_violation());
        let msg = err.to_string();
        assert!(msg.contains("tx err"));
        assert!(msg.contains("connection reset"));
    }
}

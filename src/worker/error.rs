//! Task pipeline errors

use thiserror::Error;

use super::task::{TaskId, TaskState};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Queue storage error
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// Compare-and-set lost: the task was not in the expected state
    #[error("Task {id} is {actual}, expected {expected}")]
    InvalidState {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt task row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NotFound(_) => "TASK_NOT_FOUND",
            BrokerError::InvalidState { .. } => "TASK_INVALID_STATE",
            BrokerError::Serialization(_) => "TASK_SERIALIZATION",
            BrokerError::Corrupt(_) => "TASK_CORRUPT",
            BrokerError::Database(_) => "TASK_STORAGE",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::NotFound(_) => 404,
            BrokerError::InvalidState { .. } => 409,
            BrokerError::Serialization(_) => 400,
            BrokerError::Corrupt(_) | BrokerError::Database(_) => 500,
        }
    }
}

/// Outcome of a failed handler run
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Schedule another attempt if the budget allows
    #[error("{0}")]
    Retry(#[source] BoxError),

    /// Fail the task now regardless of remaining retries
    #[error("skip retry: {0}")]
    SkipRetry(#[source] BoxError),
}

impl HandlerError {
    pub fn retry(err: impl Into<BoxError>) -> Self {
        HandlerError::Retry(err.into())
    }

    pub fn skip_retry(err: impl Into<BoxError>) -> Self {
        HandlerError::SkipRetry(err.into())
    }

    pub fn is_skip_retry(&self) -> bool {
        matches!(self, HandlerError::SkipRetry(_))
    }
}

//! Error types for dockhand-state

use thiserror::Error;

use crate::cron::CronError;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record with the given identity exists in the store
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The requested transition is not allowed from the record's current state
    #[error("invalid transition for {entity} {id}: status is {status}, {reason}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        status: String,
        reason: String,
    },

    /// Cron expression rejected at create/update time
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),

    /// Caller-supplied input failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem error from the file backend
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Relational backend error
    #[error("database error: {0}")]
    Database(String),
}

impl StorageError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

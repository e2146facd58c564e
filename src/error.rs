#![forbid(unsafe_code)]

// Error taxonomy for worker actors and their durable storage

use crate::sync::SyncError;
use thiserror::Error;

/// Failures raised inside a worker's lifecycle or workload.
///
/// Everything except `NotInitialized` and `Storage` is caught at the workload
/// boundary and turned into an error event.
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Remote rejection: {0}")]
    RemoteRejection(String),

    #[error("Assertion failed: {0}")]
    AssertionFailure(String),

    #[error("Worker not initialized")]
    NotInitialized,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation panicked: {0}")]
    Panicked(String),
}

impl From<SyncError> for WorkloadError {
    fn from(err: SyncError) -> Self {
        WorkloadError::RemoteRejection(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record for {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type WorkloadResult<T> = Result<T, WorkloadError>;

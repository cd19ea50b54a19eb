//! Error type shared by the store, queue, and transport layers.
//!
//! Public store/queue operations never hand these to callers; they log and
//! collapse them into `bool`/`Option` results. `SyncError` is for the
//! internal plumbing between those layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    #[error("record in partition {partition} has no usable `{key_path}` key")]
    MissingKey { partition: String, key_path: String },

    #[error("storage worker failed: {0}")]
    Worker(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Worker(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

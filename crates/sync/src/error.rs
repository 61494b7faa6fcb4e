use syncwire_storage::StorageError;
use thiserror::Error;

/// Failure reported by a [`ContactWriter`](crate::ContactWriter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Worth retrying later; the delivery is requeued.
    #[error("transient write failure: {0}")]
    Transient(String),

    /// Retrying will not help; an error confirmation is sent instead.
    #[error("permanent write failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid contact payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("confirmation log error: {0}")]
    Storage(#[from] StorageError),
}

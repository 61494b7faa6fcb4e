//! Durable append log for outbound confirmations.
//!
//! A confirmation that could not be published is appended here and stays
//! until a replay sweep publishes it. Ids are strictly increasing in insertion
//! order, so draining `pending()` front to back is FIFO.

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

mod memory;
mod sqlite;

pub use memory::MemoryConfirmationLog;
pub use sqlite::SqliteConfirmationLog;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("confirmation {0} not found")]
    NotFound(i64),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending,
    Sent,
}

impl ConfirmationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
        }
    }

    fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            other => Err(StorageError::QueryFailed(format!(
                "unknown confirmation status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredConfirmation {
    pub id: i64,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: ConfirmationStatus,
}

pub trait ConfirmationLog: Send + Sync + 'static {
    /// Append a payload; the returned record carries its assigned id.
    fn append(
        &self,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<StoredConfirmation, StorageError>> + Send;

    /// Oldest-first pending confirmations, at most `limit`.
    fn pending(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredConfirmation>, StorageError>> + Send;

    fn record_attempt(&self, id: i64) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn mark_sent(&self, id: i64) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Delete every confirmation already marked sent. Returns rows removed.
    fn purge_sent(&self) -> impl Future<Output = Result<u64, StorageError>> + Send;

    fn pending_count(&self) -> impl Future<Output = Result<u64, StorageError>> + Send;
}

/// Open (or create) the SQLite confirmation log at `path`, applying pending
/// migrations.
pub async fn open_confirmation_log(path: &Path) -> Result<SqliteConfirmationLog, StorageError> {
    SqliteConfirmationLog::open(path).await
}

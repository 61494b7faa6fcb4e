use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

use crate::{ConfirmationLog, ConfirmationStatus, StorageError, StoredConfirmation};

/// Process-local log with the same ordering guarantees as the SQLite log.
/// Contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryConfirmationLog {
    inner: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, StoredConfirmation>,
}

impl MemoryConfirmationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory log marked unavailable".to_string(),
            ));
        }
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

impl ConfirmationLog for MemoryConfirmationLog {
    async fn append(&self, payload: Vec<u8>) -> Result<StoredConfirmation, StorageError> {
        self.with_state(|state| {
            state.next_id += 1;
            let stored = StoredConfirmation {
                id: state.next_id,
                payload,
                created_at: Utc::now(),
                attempts: 0,
                last_attempt_at: None,
                status: ConfirmationStatus::Pending,
            };
            state.rows.insert(stored.id, stored.clone());
            Ok(stored)
        })
    }

    async fn pending(&self, limit: usize) -> Result<Vec<StoredConfirmation>, StorageError> {
        self.with_state(|state| {
            Ok(state
                .rows
                .values()
                .filter(|row| row.status == ConfirmationStatus::Pending)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn record_attempt(&self, id: i64) -> Result<(), StorageError> {
        self.with_state(|state| {
            let row = state.rows.get_mut(&id).ok_or(StorageError::NotFound(id))?;
            row.attempts = row.attempts.saturating_add(1);
            row.last_attempt_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn mark_sent(&self, id: i64) -> Result<(), StorageError> {
        self.with_state(|state| {
            let row = state.rows.get_mut(&id).ok_or(StorageError::NotFound(id))?;
            row.status = ConfirmationStatus::Sent;
            Ok(())
        })
    }

    async fn purge_sent(&self) -> Result<u64, StorageError> {
        self.with_state(|state| {
            let before = state.rows.len();
            state
                .rows
                .retain(|_, row| row.status != ConfirmationStatus::Sent);
            Ok((before - state.rows.len()) as u64)
        })
    }

    async fn pending_count(&self) -> Result<u64, StorageError> {
        self.with_state(|state| {
            Ok(state
                .rows
                .values()
                .filter(|row| row.status == ConfirmationStatus::Pending)
                .count() as u64)
        })
    }
}

//! Per-key connection lifecycle.
//!
//! Every logical connection key owns one [`ConnectionRecord`] guarded by its
//! own mutex. Starting a setup additionally takes a manager-wide lock so that
//! two keys cannot both pass the duplicate-queue check at the same time.
//!
//! ```text
//! Idle ──► SettingUp ──► Connected ──► CleaningUp ──► Idle
//!             │              │              ▲
//!             └──────────────┴──► Error ────┘
//! ```
//!
//! `SettingUp` may also go straight to `CleaningUp` when a setup is
//! abandoned, and `Error` may start a fresh setup.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use syncwire_core::ConnectionIdentity;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    SettingUp,
    Connected,
    CleaningUp,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::SettingUp => "SETTING_UP",
            Self::Connected => "CONNECTED",
            Self::CleaningUp => "CLEANING_UP",
            Self::Error => "ERROR",
        }
    }

    /// Whether this state holds a claim on its queue. A record being cleaned
    /// up still owns its consumer until the cleanup completes.
    pub fn holds_queue(self) -> bool {
        matches!(self, Self::SettingUp | Self::Connected | Self::CleaningUp)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle | Error, SettingUp) => true,
            (SettingUp, Connected) => true,
            (SettingUp | Connected | Error, CleaningUp) => true,
            (CleaningUp, Idle) => true,
            (Idle | SettingUp | Connected, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub identity: ConnectionIdentity,
    pub state: ConnectionState,
    pub changed_at: DateTime<Utc>,
    /// Fresh for every setup attempt.
    pub connection_id: Uuid,
    pub last_error: Option<String>,
    /// The registry counts a live consumer for this record.
    #[serde(skip)]
    consumer_active: bool,
}

impl ConnectionRecord {
    fn new(identity: ConnectionIdentity) -> Self {
        Self {
            identity,
            state: ConnectionState::Idle,
            changed_at: Utc::now(),
            connection_id: Uuid::nil(),
            last_error: None,
            consumer_active: false,
        }
    }

    pub fn consumer_active(&self) -> bool {
        self.consumer_active
    }

    fn release_consumer(&mut self, registry: &ConnectionRegistry) {
        if std::mem::take(&mut self.consumer_active) {
            registry.unregister(&self.identity.queue_name);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            key = %self.identity.key,
            from = %self.state,
            to = %next,
            "connection state transition"
        );
        self.state = next;
        self.changed_at = Utc::now();
    }
}

/// Per-state record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStatistics {
    pub total: usize,
    pub idle: usize,
    pub setting_up: usize,
    pub connected: usize,
    pub cleaning_up: usize,
    pub error: usize,
}

type SharedRecord = Arc<Mutex<ConnectionRecord>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ConnectionStateManager {
    records: DashMap<String, SharedRecord>,
    setup_lock: Mutex<()>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionStateManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            records: DashMap::new(),
            setup_lock: Mutex::new(()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn record(&self, key: &str) -> Option<SharedRecord> {
        self.records.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Move `key` into `SettingUp` for `owner_id` on `queue_name`.
    ///
    /// Returns `false` without changing anything when the key is busy, when
    /// another key already holds the queue, or when the registry refuses the
    /// queue.
    #[instrument(skip(self))]
    pub fn try_start_connection_setup(&self, key: &str, owner_id: &str, queue_name: &str) -> bool {
        let _setup = lock(&self.setup_lock);

        let shared = Arc::clone(
            self.records
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(ConnectionRecord::new(ConnectionIdentity::new(
                        key, owner_id, queue_name,
                    ))))
                })
                .value(),
        );
        let mut record = lock(&shared);

        match record.state {
            ConnectionState::CleaningUp => {
                debug!("cleanup in progress");
                return false;
            }
            state if state.holds_queue() => {
                if record.identity.owner_id == owner_id {
                    debug!(%state, "setup already underway for this owner");
                } else {
                    warn!(
                        %state,
                        current_owner = %record.identity.owner_id,
                        "key is held by a different owner, clean up first"
                    );
                }
                return false;
            }
            _ => {}
        }

        if let Some(holder) = self.queue_holder(key, queue_name) {
            warn!(%holder, "queue is already held by another key");
            return false;
        }

        if !self.registry.try_register(queue_name) {
            debug!("registry refused the queue");
            return false;
        }

        record.identity = ConnectionIdentity::new(key, owner_id, queue_name);
        record.connection_id = Uuid::new_v4();
        record.last_error = None;
        record.transition(ConnectionState::SettingUp);
        info!(connection_id = %record.connection_id, "connection setup started");
        true
    }

    /// Another key holding `queue_name`. Only called under the setup lock.
    fn queue_holder(&self, key: &str, queue_name: &str) -> Option<String> {
        let others: Vec<SharedRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key() != key)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        others.iter().find_map(|shared| {
            let record = lock(shared);
            (record.state.holds_queue() && record.identity.queue_name == queue_name)
                .then(|| record.identity.key.clone())
        })
    }

    #[instrument(skip(self))]
    pub fn mark_connection_established(&self, key: &str) -> bool {
        let Some(shared) = self.record(key) else {
            debug!("unknown connection key");
            return false;
        };
        let mut record = lock(&shared);
        if record.state != ConnectionState::SettingUp {
            debug!(state = %record.state, "not setting up, ignoring");
            return false;
        }

        if !self.registry.mark_active(&record.identity.queue_name) {
            warn!(queue = %record.identity.queue_name, "registry already counts a live consumer");
        }
        record.consumer_active = true;
        record.transition(ConnectionState::Connected);
        info!(connection_id = %record.connection_id, "connection established");
        true
    }

    #[instrument(skip(self))]
    pub fn mark_connection_failed(&self, key: &str, reason: &str) -> bool {
        let Some(shared) = self.record(key) else {
            debug!("unknown connection key");
            return false;
        };
        let mut record = lock(&shared);
        if !record.state.can_transition_to(ConnectionState::Error) {
            debug!(state = %record.state, "cannot fail from this state");
            return false;
        }

        record.release_consumer(&self.registry);
        record.last_error = Some(reason.to_string());
        record.transition(ConnectionState::Error);
        warn!(connection_id = %record.connection_id, "connection failed");
        true
    }

    /// Begin tearing down `key`. Returns `false` when there is nothing to
    /// clean up or a cleanup is already running. The queue stays claimed
    /// until [`mark_cleanup_complete`](Self::mark_cleanup_complete).
    #[instrument(skip(self))]
    pub fn start_cleanup(&self, key: &str) -> bool {
        let Some(shared) = self.record(key) else {
            return false;
        };
        let mut record = lock(&shared);
        if !record.state.can_transition_to(ConnectionState::CleaningUp) {
            debug!(state = %record.state, "cleanup not applicable");
            return false;
        }

        record.transition(ConnectionState::CleaningUp);
        true
    }

    #[instrument(skip(self))]
    pub fn mark_cleanup_complete(&self, key: &str) -> bool {
        let Some(shared) = self.record(key) else {
            return false;
        };
        let mut record = lock(&shared);
        if record.state != ConnectionState::CleaningUp {
            debug!(state = %record.state, "no cleanup in progress");
            return false;
        }
        record.release_consumer(&self.registry);
        record.transition(ConnectionState::Idle);
        info!("cleanup complete");
        true
    }

    /// Unknown keys are `Idle`.
    pub fn get_state(&self, key: &str) -> ConnectionState {
        self.record(key)
            .map(|shared| lock(&shared).state)
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn get_record(&self, key: &str) -> Option<ConnectionRecord> {
        self.record(key).map(|shared| lock(&shared).clone())
    }

    pub fn get_statistics(&self) -> StateStatistics {
        let records: Vec<SharedRecord> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut stats = StateStatistics {
            total: records.len(),
            ..StateStatistics::default()
        };
        for shared in &records {
            match lock(shared).state {
                ConnectionState::Idle => stats.idle += 1,
                ConnectionState::SettingUp => stats.setting_up += 1,
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::CleaningUp => stats.cleaning_up += 1,
                ConnectionState::Error => stats.error += 1,
            }
        }
        stats
    }

    /// Queue names currently claimed by some key.
    pub fn held_queues(&self) -> HashSet<String> {
        let records: Vec<SharedRecord> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        records
            .iter()
            .filter_map(|shared| {
                let record = lock(shared);
                record
                    .state
                    .holds_queue()
                    .then(|| record.identity.queue_name.clone())
            })
            .collect()
    }
}

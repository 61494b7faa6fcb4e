//! Process-wide guard against two consumers on the same queue.
//!
//! Distinct connection keys can end up pointing at the same queue name (for
//! example after the owner identity changes), so the per-key state machine
//! alone cannot rule out duplicates. The registry tracks every queue name it
//! has seen, when a connection to it was last attempted, and whether a
//! consumer is currently live on it.
//!
//! Registration is two-phase: [`ConnectionRegistry::try_register`] claims the
//! right to attempt a connection and starts the cooldown, and
//! [`ConnectionRegistry::mark_active`] records that the consumer actually came
//! up. A failed attempt therefore leaves nothing to clean up besides the
//! cooldown, which expires on its own.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use syncwire_core::config::RegistryConfig;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
struct Entry {
    active_count: u32,
    last_attempt: Option<Instant>,
    last_attempt_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one queue's registration, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub queue_name: String,
    pub active_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

pub struct ConnectionRegistry {
    entries: DashMap<String, Entry>,
    cooldown: Duration,
}

impl ConnectionRegistry {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            cooldown,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.cooldown())
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Claim a connection attempt for `queue_name`.
    ///
    /// Returns `false` when a consumer is already live on the queue or when
    /// the previous attempt happened less than one cooldown ago.
    #[instrument(skip(self))]
    pub fn try_register(&self, queue_name: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.entries.entry(queue_name.to_string()).or_default();

        if entry.active_count > 0 {
            debug!(active = entry.active_count, "queue already has a live consumer");
            return false;
        }
        if let Some(last) = entry.last_attempt {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                debug!(?elapsed, cooldown = ?self.cooldown, "queue attempted too recently");
                return false;
            }
        }

        entry.last_attempt = Some(now);
        entry.last_attempt_at = Some(Utc::now());
        debug!("connection attempt registered");
        true
    }

    /// Record that the consumer for `queue_name` is live. The count never
    /// goes above one; a second activation is refused.
    #[instrument(skip(self))]
    pub fn mark_active(&self, queue_name: &str) -> bool {
        let mut entry = self.entries.entry(queue_name.to_string()).or_default();
        if entry.active_count > 0 {
            warn!("refusing to mark a second live consumer");
            return false;
        }
        entry.active_count = 1;
        true
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, queue_name: &str) {
        match self.entries.get_mut(queue_name) {
            Some(mut entry) if entry.active_count > 0 => {
                entry.active_count -= 1;
                debug!(active = entry.active_count, "consumer unregistered");
            }
            _ => debug!("queue had no live consumer"),
        }
    }

    pub fn active_count(&self, queue_name: &str) -> u32 {
        self.entries
            .get(queue_name)
            .map(|entry| entry.active_count)
            .unwrap_or(0)
    }

    /// Forget every queue. Called at process start and stop so entries from an
    /// abnormal exit cannot block the next run.
    pub fn clear_all(&self) {
        let cleared = self.entries.len();
        self.entries.clear();
        info!(cleared, "connection registry cleared");
    }

    /// All known queues, sorted by name.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .entries
            .iter()
            .map(|item| RegistryEntry {
                queue_name: item.key().clone(),
                active_count: item.active_count,
                last_attempt: item.last_attempt_at,
            })
            .collect();
        entries.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        entries
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn rejects_within_cooldown_then_accepts() {
        let registry = ConnectionRegistry::new(Duration::from_millis(50));
        assert!(registry.try_register("Q1"));
        assert!(!registry.try_register("Q1"));

        thread::sleep(Duration::from_millis(70));
        assert!(registry.try_register("Q1"));
    }

    #[test]
    fn queues_are_independent() {
        let registry = ConnectionRegistry::default();
        assert!(registry.try_register("Q1"));
        assert!(registry.try_register("Q2"));
    }

    #[test]
    fn live_consumer_blocks_registration_past_cooldown() {
        let registry = ConnectionRegistry::new(Duration::ZERO);
        assert!(registry.try_register("Q1"));
        assert!(registry.mark_active("Q1"));
        assert!(!registry.try_register("Q1"));

        registry.unregister("Q1");
        assert!(registry.try_register("Q1"));
    }

    #[test]
    fn active_count_never_exceeds_one_or_drops_below_zero() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.active_count("Q1"), 0);

        assert!(registry.mark_active("Q1"));
        assert!(!registry.mark_active("Q1"));
        assert_eq!(registry.active_count("Q1"), 1);

        registry.unregister("Q1");
        registry.unregister("Q1");
        registry.unregister("never-seen");
        assert_eq!(registry.active_count("Q1"), 0);
    }

    #[test]
    fn clear_all_forgets_cooldowns_and_consumers() {
        let registry = ConnectionRegistry::default();
        assert!(registry.try_register("Q1"));
        assert!(registry.mark_active("Q1"));

        registry.clear_all();

        assert_eq!(registry.active_count("Q1"), 0);
        assert!(registry.snapshot().is_empty());
        assert!(registry.try_register("Q1"));
    }

    #[test]
    fn snapshot_is_sorted_and_reports_attempts() {
        let registry = ConnectionRegistry::default();
        assert!(registry.try_register("b"));
        assert!(registry.mark_active("a"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].queue_name, "a");
        assert_eq!(snapshot[0].active_count, 1);
        assert!(snapshot[0].last_attempt.is_none());
        assert_eq!(snapshot[1].queue_name, "b");
        assert!(snapshot[1].last_attempt.is_some());
    }

    #[test]
    fn concurrent_registrations_admit_exactly_one() {
        let registry = Arc::new(ConnectionRegistry::default());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.try_register("Q1")
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}

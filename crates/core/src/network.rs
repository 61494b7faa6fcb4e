//! Network viability collaborator.
//!
//! The broker connection never inspects interfaces itself. It asks a
//! [`NetworkMonitor`] whether a connection attempt is worth making and which
//! class of network it would run over, and sizes prefetch and AMQP frames
//! from that answer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Unmetered,
    Metered,
    Constrained,
    Offline,
}

impl NetworkClass {
    /// Largest AMQP frame to negotiate over this class of network.
    pub fn frame_max_bytes(self) -> u32 {
        match self {
            Self::Unmetered => 128 * 1024,
            Self::Metered => 64 * 1024,
            Self::Constrained | Self::Offline => 32 * 1024,
        }
    }

    pub fn is_constrained(self) -> bool {
        matches!(self, Self::Constrained)
    }
}

#[async_trait]
pub trait NetworkMonitor: Send + Sync + 'static {
    /// Whether a connection attempt has any chance of succeeding right now.
    fn is_viable(&self) -> bool;

    fn network_class(&self) -> NetworkClass;

    /// Wait until the network becomes viable or `max_wait` elapses.
    /// Returns the viability at the end of the wait.
    async fn wait_for_network(&self, max_wait: Duration) -> bool;
}

/// A monitor whose state is pushed in from outside, typically by the host
/// platform's connectivity callbacks.
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    available: AtomicBool,
    class: Mutex<NetworkClass>,
    changed: Notify,
}

impl ManualNetworkMonitor {
    pub fn new(class: NetworkClass) -> Self {
        Self {
            available: AtomicBool::new(class != NetworkClass::Offline),
            class: Mutex::new(class),
            changed: Notify::new(),
        }
    }

    /// A monitor that always reports an unmetered, viable network.
    pub fn online() -> Self {
        Self::new(NetworkClass::Unmetered)
    }

    pub fn set_class(&self, class: NetworkClass) {
        *self.class.lock().unwrap_or_else(|e| e.into_inner()) = class;
        self.set_available(class != NetworkClass::Offline);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.changed.notify_waiters();
        }
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::online()
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    fn is_viable(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn network_class(&self) -> NetworkClass {
        if !self.is_viable() {
            return NetworkClass::Offline;
        }
        *self.class.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_for_network(&self, max_wait: Duration) -> bool {
        let notified = self.changed.notified();
        if self.is_viable() {
            return true;
        }
        let _ = tokio::time::timeout(max_wait, notified).await;
        self.is_viable()
    }
}

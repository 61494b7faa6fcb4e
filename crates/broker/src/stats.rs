use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use syncwire_core::LinkState;

#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    pub(crate) deliveries_received: AtomicU64,
    pub(crate) deliveries_acked: AtomicU64,
    pub(crate) deliveries_nacked: AtomicU64,
    pub(crate) messages_published: AtomicU64,
    pub(crate) publish_failures: AtomicU64,
    pub(crate) sessions_opened: AtomicU64,
    pub(crate) reconnect_attempts: AtomicU64,
}

impl ConnectionCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one broker connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub queue: String,
    pub state: LinkState,
    pub is_connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub deliveries_received: u64,
    pub deliveries_acked: u64,
    pub deliveries_nacked: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub sessions_opened: u64,
    pub reconnect_attempts: u64,
}

pub(crate) struct StatsInputs {
    pub(crate) queue: String,
    pub(crate) state: LinkState,
    pub(crate) is_connected: bool,
    pub(crate) connected_since: Option<DateTime<Utc>>,
    pub(crate) consecutive_failures: u32,
    pub(crate) last_error: Option<String>,
}

impl ConnectionStats {
    pub(crate) fn collect(inputs: StatsInputs, counters: &ConnectionCounters) -> Self {
        Self {
            queue: inputs.queue,
            state: inputs.state,
            is_connected: inputs.is_connected,
            connected_since: inputs.connected_since,
            consecutive_failures: inputs.consecutive_failures,
            last_error: inputs.last_error,
            deliveries_received: ConnectionCounters::read(&counters.deliveries_received),
            deliveries_acked: ConnectionCounters::read(&counters.deliveries_acked),
            deliveries_nacked: ConnectionCounters::read(&counters.deliveries_nacked),
            messages_published: ConnectionCounters::read(&counters.messages_published),
            publish_failures: ConnectionCounters::read(&counters.publish_failures),
            sessions_opened: ConnectionCounters::read(&counters.sessions_opened),
            reconnect_attempts: ConnectionCounters::read(&counters.reconnect_attempts),
        }
    }
}

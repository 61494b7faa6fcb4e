use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::types::LinkState;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase a-z, 0-9 and dots only
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "broker" | "sync")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "broker.connection.state")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// Broker connection for the named queue
    Broker(String),
    /// Contact sync processing
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Broker connection events ──────────────────────────────────
    ConnectionStateChanged {
        queue: String,
        state: LinkState,
    },
    ConnectionEstablished {
        queue: String,
    },
    ConnectionLost {
        queue: String,
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        queue: String,
        attempt: u32,
        delay_ms: u64,
    },

    // ── Sync events ───────────────────────────────────────────────
    ContactApplied {
        contact_id: String,
        operation: String,
    },
    ConfirmationQueued {
        contact_id: String,
        log_id: i64,
    },
    ConfirmationsReplayed {
        replayed: usize,
        remaining: usize,
    },
    SlaViolated {
        contact_id: Option<String>,
        elapsed_ms: u64,
        threshold_ms: u64,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;
}

/// Publish a payload on a channel, logging instead of failing when the
/// channel name is rejected. Emitters treat the bus as best-effort.
pub fn emit(bus: &dyn EventBus, channel: &str, source: EventSource, payload: EventPayload) {
    match Channel::new(channel) {
        Ok(valid) => {
            if let Err(error) = bus.publish(Event::new(valid, source, payload)) {
                tracing::warn!(%error, channel, "failed to publish event");
            }
        }
        Err(error) => tracing::warn!(%error, channel, "refusing to publish on invalid channel"),
    }
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    broker_sender: broadcast::Sender<Event>,
    sync_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (broker_sender, _) = broadcast::channel(capacity);
        let (sync_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            broker_sender,
            sync_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "broker" => Some(&self.broker_sender),
            "sync" => Some(&self.sync_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                broker: Some(self.broker_sender.subscribe()),
                sync: Some(self.sync_sender.subscribe()),
            });
        }

        let mut receivers = DomainReceivers::default();
        match first_segment {
            "system" => receivers.system = Some(self.system_sender.subscribe()),
            "broker" => receivers.broker = Some(self.broker_sender.subscribe()),
            "sync" => receivers.sync = Some(self.sync_sender.subscribe()),
            _ => return Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    broker: Option<broadcast::Receiver<Event>>,
    sync: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        loop {
            let received = tokio::select! {
                result = recv_from_domain(self.receivers.system.as_mut()) => result,
                result = recv_from_domain(self.receivers.broker.as_mut()) => result,
                result = recv_from_domain(self.receivers.sync.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}

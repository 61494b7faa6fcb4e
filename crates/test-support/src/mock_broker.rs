//! In-process stand-in for a RabbitMQ broker.
//!
//! A [`MockBroker`] registers itself under a unique host name. Point a
//! connection's settings at that host and use [`MockTransport`] as the
//! transport type; every session opened by the connection then talks to the
//! mock, which records what happened and lets tests push deliveries or
//! force broker-side shutdowns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use futures::channel::mpsc;
use syncwire_broker::{
    BrokerError, BrokerTransport, ConnectionSettings, DeliveryEvent, DeliveryStream, RawDelivery,
    ShutdownSignal, Topology, TransportSettings,
};
use syncwire_core::config::BrokerConfig;
use uuid::Uuid;

static BROKERS: OnceLock<DashMap<String, Arc<MockBroker>>> = OnceLock::new();

fn brokers() -> &'static DashMap<String, Arc<MockBroker>> {
    BROKERS.get_or_init(DashMap::new)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    connect_failures: VecDeque<BrokerError>,
    publish_failures: usize,
    publish_delay: Option<Duration>,
    next_session: u64,
    live_session: Option<u64>,
    delivery_tx: Option<mpsc::UnboundedSender<DeliveryEvent>>,
    next_tag: u64,
    consumers: Vec<String>,
    max_concurrent_consumers: usize,
    declared: Vec<Topology>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    published: Vec<PublishedMessage>,
    connects: usize,
    closes: usize,
    last_prefetch: Option<u16>,
    last_settings: Option<TransportSettings>,
}

pub struct MockBroker {
    host: String,
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn start() -> Arc<Self> {
        let broker = Arc::new(Self {
            host: format!("mock-{}", Uuid::new_v4()),
            state: Mutex::new(BrokerState::default()),
        });
        brokers().insert(broker.host.clone(), Arc::clone(&broker));
        broker
    }

    fn lookup(host: &str) -> Option<Arc<Self>> {
        brokers().get(host).map(|entry| Arc::clone(entry.value()))
    }

    /// Unregister the broker; later connects fail with a DNS error.
    pub fn stop(&self) {
        brokers().remove(&self.host);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.host.clone(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            use_tls: false,
            heartbeat_seconds: 30,
            connect_timeout_seconds: 2,
        }
    }

    /// Connection settings pointed at this broker with timeouts short
    /// enough for tests.
    pub fn connection_settings(&self, queue: &str) -> ConnectionSettings {
        ConnectionSettings {
            broker: self.broker_config(),
            topology: Topology {
                exchange: "contact_sync_exchange".to_string(),
                inbound_queue: queue.to_string(),
                inbound_routing_key: "contact.sync".to_string(),
                confirmation_queue: "contact_callback_queue".to_string(),
                confirmation_routing_key: "contact.callback".to_string(),
            },
            prefetch: 50,
            constrained_prefetch: 10,
            channel_capacity: 32,
            handler_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_millis(300),
            shutdown_timeout: Duration::from_millis(500),
            auto_reconnect: true,
            graceful_shutdown_cooldown: Duration::from_millis(150),
            max_reconnect_delay: Some(Duration::from_millis(50)),
            network_wait: Duration::from_millis(100),
        }
    }

    // ── Scripting ─────────────────────────────────────────────────

    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.state().connect_failures.extend(errors);
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.state().publish_failures = count;
    }

    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.state().publish_delay = delay;
    }

    /// Push a delivery to the live consumer. Returns its delivery tag, or
    /// `None` when nobody is consuming.
    pub fn deliver(&self, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let mut state = self.state();
        let delivery_tag = state.next_tag + 1;
        let sender = state.delivery_tx.as_ref()?;
        sender
            .unbounded_send(DeliveryEvent::Delivery(RawDelivery {
                delivery_tag,
                payload: payload.into(),
                redelivered: false,
            }))
            .ok()?;
        state.next_tag = delivery_tag;
        Some(delivery_tag)
    }

    /// Close the live session from the broker side.
    pub fn shutdown(&self, graceful: bool, reason: &str) {
        let mut state = self.state();
        if let Some(sender) = state.delivery_tx.take() {
            let _ = sender.unbounded_send(DeliveryEvent::Shutdown(ShutdownSignal {
                graceful,
                reason: reason.to_string(),
            }));
        }
        state.live_session = None;
        state.consumers.clear();
    }

    // ── Observations ──────────────────────────────────────────────

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state().nacks.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn declared_topologies(&self) -> Vec<Topology> {
        self.state().declared.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    pub fn active_consumers(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn max_concurrent_consumers(&self) -> usize {
        self.state().max_concurrent_consumers
    }

    pub fn last_prefetch(&self) -> Option<u16> {
        self.state().last_prefetch
    }

    pub fn last_settings(&self) -> Option<TransportSettings> {
        self.state().last_settings.clone()
    }

    pub fn has_live_session(&self) -> bool {
        self.state().live_session.is_some()
    }

    /// Poll `condition` until it holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_settled(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |broker| {
            let state = broker.state();
            state.acks.len() + state.nacks.len() >= count
        })
        .await
    }

    fn open_session(&self, settings: &TransportSettings) -> Result<u64, BrokerError> {
        let mut state = self.state();
        state.connects += 1;
        state.last_settings = Some(settings.clone());
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        state.next_session += 1;
        let session = state.next_session;
        state.live_session = Some(session);
        Ok(session)
    }
}

/// Transport that routes every call to the [`MockBroker`] registered under
/// the settings' host.
pub struct MockTransport {
    broker: Arc<MockBroker>,
    session: u64,
    open: bool,
}

impl MockTransport {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed(format!(
                "mock session {} is closed",
                self.session
            )))
        }
    }
}

impl BrokerTransport for MockTransport {
    async fn connect(settings: &TransportSettings) -> Result<Self, BrokerError> {
        let broker = MockBroker::lookup(&settings.host).ok_or_else(|| {
            BrokerError::DnsResolutionFailed(format!("unknown mock host {}", settings.host))
        })?;
        let session = broker.open_session(settings)?;
        Ok(Self {
            broker,
            session,
            open: true,
        })
    }

    async fn declare_topology(&mut self, topology: &Topology) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state().declared.push(topology.clone());
        Ok(())
    }

    async fn consume(
        &mut self,
        _queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.broker.state();
        state.consumers.push(consumer_tag.to_string());
        state.max_concurrent_consumers = state.max_concurrent_consumers.max(state.consumers.len());
        state.last_prefetch = Some(prefetch);
        state.delivery_tx = Some(sender);
        Ok(receiver.boxed())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state().acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state().nacks.push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let delay = self.broker.state().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.state();
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(BrokerError::Transport("publish nacked by mock broker".to_string()));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn cancel_consumer(&mut self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.consumers.retain(|tag| tag != consumer_tag);
        if state.live_session == Some(self.session) {
            state.delivery_tx = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.open = false;
        let mut state = self.broker.state();
        state.closes += 1;
        if state.live_session == Some(self.session) {
            state.live_session = None;
            state.delivery_tx = None;
            state.consumers.clear();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && self.broker.state().live_session == Some(self.session)
    }
}

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use syncwire_core::LinkState;
use syncwire_core::config::{BrokerConfig, Config};
use syncwire_core::event::{EventBus, EventPayload, EventSource, emit};
use syncwire_core::network::NetworkMonitor;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::amqp::AmqpTransport;
use crate::classifier::{FailureTracker, RetryDecision, classify};
use crate::dispatch::run_dispatch;
use crate::error::BrokerError;
use crate::handler::DeliveryHandler;
use crate::stats::{ConnectionCounters, ConnectionStats, StatsInputs};
use crate::transport::{BrokerTransport, ShutdownSignal, Topology, TransportSettings};
use crate::worker::{Control, PublishRequest, WorkerChannels, WorkerParams, spawn_worker};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker: BrokerConfig,
    pub topology: Topology,
    pub prefetch: u16,
    pub constrained_prefetch: u16,
    pub channel_capacity: usize,
    pub handler_timeout: Duration,
    pub publish_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub auto_reconnect: bool,
    pub graceful_shutdown_cooldown: Duration,
    pub max_reconnect_delay: Option<Duration>,
    pub network_wait: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker: config.broker.clone(),
            topology: Topology::from_config(&config.queues, &config.device.owner_id),
            prefetch: config.processing.prefetch,
            constrained_prefetch: config.processing.constrained_prefetch,
            channel_capacity: config.processing.channel_capacity,
            handler_timeout: config.processing.handler_timeout(),
            publish_timeout: config.processing.publish_timeout(),
            shutdown_timeout: config.processing.shutdown_timeout(),
            auto_reconnect: config.reconnect.enabled,
            graceful_shutdown_cooldown: config.reconnect.graceful_shutdown_cooldown(),
            max_reconnect_delay: config.reconnect.max_delay(),
            network_wait: config.reconnect.network_wait(),
        }
    }
}

/// One live session: the worker thread's queues plus the processing task.
struct Session {
    id: u64,
    consumer_tag: String,
    closing: Arc<AtomicBool>,
    channel_open: Arc<AtomicBool>,
    cancel: CancellationToken,
    control_tx: mpsc::UnboundedSender<Control>,
    publish_tx: mpsc::Sender<PublishRequest>,
    dispatch: JoinHandle<()>,
}

impl Session {
    /// In-flight handlers get their full handler timeout plus the shutdown
    /// timeout to settle before the dispatch task is dropped.
    async fn close(self, settings: &ConnectionSettings) {
        let Session {
            id,
            consumer_tag,
            closing,
            cancel,
            control_tx,
            publish_tx,
            mut dispatch,
            ..
        } = self;

        closing.store(true, Ordering::SeqCst);
        cancel.cancel();
        drop(publish_tx);

        let shutdown_timeout = settings.shutdown_timeout;
        let drain_timeout = settings.handler_timeout + shutdown_timeout;
        if tokio::time::timeout(drain_timeout, &mut dispatch)
            .await
            .is_err()
        {
            warn!(
                session = id,
                timeout = ?drain_timeout,
                "in-flight deliveries did not settle, abandoning them"
            );
            dispatch.abort();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if control_tx.send(Control::Shutdown { reply: reply_tx }).is_ok()
            && tokio::time::timeout(shutdown_timeout, reply_rx).await.is_err()
        {
            warn!(
                session = id,
                consumer_tag = %consumer_tag,
                "broker worker did not shut down in time, abandoning it"
            );
        }
        drop(control_tx);
        debug!(session = id, "session torn down");
    }
}

struct Inner {
    settings: ConnectionSettings,
    network: Arc<dyn NetworkMonitor>,
    event_bus: Option<Arc<dyn EventBus>>,
    running: AtomicBool,
    connected: AtomicBool,
    state: Mutex<LinkState>,
    session: Mutex<Option<Session>>,
    handler: Mutex<Option<Arc<dyn DeliveryHandler>>>,
    failures: Mutex<FailureTracker>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_generation: AtomicU64,
    session_seq: AtomicU64,
    counters: Arc<ConnectionCounters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn queue(&self) -> &str {
        &self.settings.topology.inbound_queue
    }

    fn take_session(&self) -> Option<Session> {
        lock(&self.session).take()
    }

    fn take_session_if(&self, id: u64) -> Option<Session> {
        let mut slot = lock(&self.session);
        if slot.as_ref().is_some_and(|session| session.id == id) {
            slot.take()
        } else {
            None
        }
    }

    fn channel_open(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .is_some_and(|session| session.channel_open.load(Ordering::SeqCst))
    }

    fn publish_sender(&self) -> Option<mpsc::Sender<PublishRequest>> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.publish_tx.clone())
    }

    fn handler(&self) -> Option<Arc<dyn DeliveryHandler>> {
        lock(&self.handler).clone()
    }
}

/// A self-healing connection to one inbound queue.
///
/// Cloning is cheap and every clone drives the same connection. The
/// transport itself lives on a dedicated worker thread per session; this
/// handle only exchanges messages with it. Call [`disconnect`] before
/// dropping the last handle, since the registered handler usually holds a
/// clone of the connection for publishing.
///
/// [`disconnect`]: BrokerConnection::disconnect
pub struct BrokerConnection<T: BrokerTransport = AmqpTransport> {
    inner: Arc<Inner>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: BrokerTransport> Clone for BrokerConnection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _transport: PhantomData,
        }
    }
}

impl<T: BrokerTransport> BrokerConnection<T> {
    pub fn new(settings: ConnectionSettings, network: Arc<dyn NetworkMonitor>) -> Self {
        Self::build(settings, network, None)
    }

    pub fn with_event_bus(
        settings: ConnectionSettings,
        network: Arc<dyn NetworkMonitor>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self::build(settings, network, Some(event_bus))
    }

    fn build(
        settings: ConnectionSettings,
        network: Arc<dyn NetworkMonitor>,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        let failures = FailureTracker::new(settings.max_reconnect_delay);
        Self::from_inner(Arc::new(Inner {
            settings,
            network,
            event_bus,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            state: Mutex::new(LinkState::Disconnected),
            session: Mutex::new(None),
            handler: Mutex::new(None),
            failures: Mutex::new(failures),
            reconnect_task: Mutex::new(None),
            connected_since: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect_generation: AtomicU64::new(0),
            session_seq: AtomicU64::new(0),
            counters: Arc::new(ConnectionCounters::default()),
        }))
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            _transport: PhantomData,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.inner.queue()
    }

    pub fn state(&self) -> LinkState {
        lock(&self.inner.state).clone()
    }

    /// Start consuming with `handler`. Returns whether a session is live when
    /// the call returns; on failure a reconnect has already been scheduled.
    pub async fn connect(&self, handler: Arc<dyn DeliveryHandler>) -> bool {
        self.inner.running.store(true, Ordering::SeqCst);
        *lock(&self.inner.handler) = Some(handler);
        self.inner.reconnect_generation.fetch_add(1, Ordering::SeqCst);
        self.establish().await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
            && self.inner.connected.load(Ordering::SeqCst)
            && self.inner.channel_open()
    }

    /// Publish a confirmation to the fixed outbound queue. Never waits
    /// longer than the publish timeout.
    pub async fn publish(&self, payload: Vec<u8>) -> bool {
        let counters = &self.inner.counters;
        let publish_tx = match self.inner.publish_sender() {
            Some(publish_tx) if self.is_connected() => publish_tx,
            _ => {
                debug!(queue = %self.queue_name(), "publish skipped, not connected");
                ConnectionCounters::bump(&counters.publish_failures);
                return false;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PublishRequest {
            payload,
            reply: reply_tx,
        };
        let publish_timeout = self.inner.settings.publish_timeout;
        let outcome = tokio::time::timeout(publish_timeout, async move {
            publish_tx
                .send(request)
                .await
                .map_err(|_| BrokerError::ChannelClosed("publish queue closed".to_string()))?;
            reply_rx.await.map_err(|_| {
                BrokerError::ChannelClosed("worker dropped publish request".to_string())
            })?
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                ConnectionCounters::bump(&counters.messages_published);
                true
            }
            Ok(Err(error)) => {
                warn!(queue = %self.queue_name(), %error, "publish failed");
                ConnectionCounters::bump(&counters.publish_failures);
                false
            }
            Err(_) => {
                warn!(queue = %self.queue_name(), timeout = ?publish_timeout, "publish timed out");
                ConnectionCounters::bump(&counters.publish_failures);
                false
            }
        }
    }

    /// Stop consuming and close the session. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        self.inner.reconnect_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&self.inner.reconnect_task).take() {
            task.abort();
        }

        let _guard = self.inner.connect_lock.lock().await;
        *lock(&self.inner.handler) = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        *lock(&self.inner.connected_since) = None;

        if let Some(session) = self.inner.take_session() {
            session.close(&self.inner.settings).await;
        }

        if was_running {
            info!(queue = %self.queue_name(), "broker connection closed");
            self.emit_connection_lost("disconnect requested".to_string(), false);
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Connectivity came back. Forget accumulated failures and try again
    /// right away instead of waiting out the current backoff.
    pub async fn on_network_available(&self) -> bool {
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        info!(queue = %self.queue_name(), "network available, reconnecting");
        lock(&self.inner.failures).reset();
        self.inner.reconnect_generation.fetch_add(1, Ordering::SeqCst);
        self.establish().await
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        let (consecutive_failures, last_error) = {
            let failures = lock(&self.inner.failures);
            (
                failures.consecutive_failures(),
                failures.last_error().map(str::to_owned),
            )
        };
        let connected_since = *lock(&self.inner.connected_since);

        ConnectionStats::collect(
            StatsInputs {
                queue: self.queue_name().to_string(),
                state: self.state(),
                is_connected: self.is_connected(),
                connected_since,
                consecutive_failures,
                last_error,
            },
            &self.inner.counters,
        )
    }

    async fn establish(&self) -> bool {
        let _guard = self.inner.connect_lock.lock().await;
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        if let Some(stale) = self.inner.take_session() {
            debug!(queue = %self.queue_name(), "tearing down stale session");
            self.inner.connected.store(false, Ordering::SeqCst);
            stale.close(&self.inner.settings).await;
        }

        if lock(&self.inner.failures).consecutive_failures() == 0 {
            self.set_state(LinkState::Connecting);
        }

        let Some(handler) = self.inner.handler() else {
            debug!(queue = %self.queue_name(), "no handler registered, not connecting");
            return false;
        };

        match self.open_session(handler).await {
            Ok((session, signal_rx)) => {
                let session_id = session.id;
                let cancel = session.cancel.clone();
                *lock(&self.inner.session) = Some(session);
                self.inner.connected.store(true, Ordering::SeqCst);
                *lock(&self.inner.connected_since) = Some(Utc::now());
                lock(&self.inner.failures).reset();
                ConnectionCounters::bump(&self.inner.counters.sessions_opened);

                self.spawn_supervisor(session_id, cancel, signal_rx);
                self.set_state(LinkState::Connected);
                self.emit(
                    "broker.connection.established",
                    EventPayload::ConnectionEstablished {
                        queue: self.queue_name().to_string(),
                    },
                );
                info!(queue = %self.queue_name(), session = session_id, "broker connection established");
                true
            }
            Err(error) => {
                self.handle_connect_failure(error);
                false
            }
        }
    }

    async fn open_session(
        &self,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(Session, mpsc::UnboundedReceiver<ShutdownSignal>), BrokerError> {
        let network = &self.inner.network;
        if !network.is_viable() {
            return Err(BrokerError::NetworkUnavailable(
                "no viable network".to_string(),
            ));
        }

        let settings = &self.inner.settings;
        let network_class = network.network_class();
        let prefetch = if network_class.is_constrained() {
            settings.constrained_prefetch
        } else {
            settings.prefetch
        };
        let id = self.inner.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let consumer_tag = format!("syncwire-{}", Uuid::new_v4());
        let closing = Arc::new(AtomicBool::new(false));
        let channel_open = Arc::new(AtomicBool::new(false));
        let capacity = settings.channel_capacity.max(1);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        debug!(
            queue = %self.queue_name(),
            session = id,
            ?network_class,
            prefetch,
            "opening broker session"
        );

        spawn_worker::<T>(
            WorkerParams {
                settings: TransportSettings::from_config(&settings.broker, network_class),
                topology: settings.topology.clone(),
                consumer_tag: consumer_tag.clone(),
                prefetch,
                closing: Arc::clone(&closing),
                channel_open: Arc::clone(&channel_open),
                counters: Arc::clone(&self.inner.counters),
            },
            WorkerChannels {
                control_rx,
                ack_rx,
                publish_rx,
                inbound_tx,
                signal_tx,
                ready_tx,
            },
        )?;

        let connect_timeout = settings.broker.connect_timeout();
        match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => return Err(error),
            Ok(Err(_)) => {
                return Err(BrokerError::Transport(
                    "broker worker exited before the session was ready".to_string(),
                ));
            }
            Err(_) => {
                closing.store(true, Ordering::SeqCst);
                return Err(BrokerError::ConnectTimeout(connect_timeout));
            }
        }

        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(run_dispatch(
            inbound_rx,
            ack_tx,
            handler,
            settings.handler_timeout,
            cancel.clone(),
        ));

        Ok((
            Session {
                id,
                consumer_tag,
                closing,
                channel_open,
                cancel,
                control_tx,
                publish_tx,
                dispatch,
            },
            signal_rx,
        ))
    }

    /// Watch one session for an unrequested shutdown. Holds only a weak
    /// reference so an abandoned connection can still be dropped.
    fn spawn_supervisor(
        &self,
        session_id: u64,
        cancel: CancellationToken,
        mut signal_rx: mpsc::UnboundedReceiver<ShutdownSignal>,
    ) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let signal = tokio::select! {
                _ = cancel.cancelled() => return,
                signal = signal_rx.recv() => signal,
            };
            let (Some(signal), Some(inner)) = (signal, inner.upgrade()) else {
                return;
            };
            Self::from_inner(inner)
                .handle_session_lost(session_id, signal)
                .await;
        });
    }

    async fn handle_session_lost(&self, session_id: u64, signal: ShutdownSignal) {
        {
            let _guard = self.inner.connect_lock.lock().await;
            let Some(session) = self.inner.take_session_if(session_id) else {
                return;
            };
            self.inner.connected.store(false, Ordering::SeqCst);
            *lock(&self.inner.connected_since) = None;
            session.close(&self.inner.settings).await;
        }

        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }

        if signal.graceful {
            let cooldown = self.inner.settings.graceful_shutdown_cooldown;
            warn!(
                queue = %self.queue_name(),
                reason = %signal.reason,
                ?cooldown,
                "broker closed the session, reconnecting after cooldown"
            );
            let attempt = lock(&self.inner.failures).consecutive_failures() + 1;
            self.emit_connection_lost(signal.reason, true);
            self.set_state(LinkState::Reconnecting { attempt });
            self.emit_reconnecting(attempt, cooldown);
            self.schedule_reconnect(cooldown, false);
        } else {
            self.handle_connect_failure(BrokerError::Transport(signal.reason));
        }
    }

    fn handle_connect_failure(&self, error: BrokerError) {
        let classification = classify(&error);
        if !self.inner.running.load(Ordering::SeqCst) {
            debug!(queue = %self.queue_name(), %error, "connection failed after disconnect");
            return;
        }

        let decision = lock(&self.inner.failures).record(&classification);
        let will_retry =
            self.inner.settings.auto_reconnect && matches!(decision, RetryDecision::Retry { .. });

        warn!(
            queue = %self.queue_name(),
            category = %classification.category,
            recoverable = classification.recoverable,
            %error,
            "broker connection failed"
        );
        self.emit_connection_lost(error.to_string(), will_retry);
        self.emit(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: "broker".to_string(),
                message: error.to_string(),
                recoverable: classification.recoverable,
            },
        );

        match decision {
            RetryDecision::Retry { attempt, delay } if will_retry => {
                self.set_state(LinkState::Reconnecting { attempt });
                self.emit_reconnecting(attempt, delay);
                debug!(queue = %self.queue_name(), attempt, ?delay, "reconnect scheduled");
                self.schedule_reconnect(delay, classification.check_network);
            }
            RetryDecision::Retry { .. } => self.set_state(LinkState::Error),
            RetryDecision::GiveUp { attempt } => {
                error!(
                    queue = %self.queue_name(),
                    category = %classification.category,
                    attempts = attempt,
                    "giving up on broker connection"
                );
                self.set_state(LinkState::Error);
            }
        }
    }

    fn schedule_reconnect(&self, delay: Duration, check_network: bool) {
        let generation = self.inner.reconnect_generation.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionCounters::bump(&self.inner.counters.reconnect_attempts);
        let task = tokio::spawn(self.clone().reconnect_after(delay, check_network, generation));
        // The task being replaced may be the one calling us; it exits on its
        // own once it sees the generation has moved on.
        *lock(&self.inner.reconnect_task) = Some(task);
    }

    fn reconnect_after(
        self,
        delay: Duration,
        check_network: bool,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            if !self.is_current(generation) {
                return;
            }

            let network = Arc::clone(&self.inner.network);
            if check_network
                && !network.is_viable()
                && !network.wait_for_network(self.inner.settings.network_wait).await
            {
                debug!(queue = %self.queue_name(), "network still unavailable");
            }
            if !self.is_current(generation) {
                return;
            }

            self.establish().await;
        }
        .boxed()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.running.load(Ordering::SeqCst)
            && self.inner.reconnect_generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: LinkState) {
        {
            let mut current = lock(&self.inner.state);
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        debug!(queue = %self.queue_name(), %state, "link state changed");
        self.emit(
            "broker.connection.state",
            EventPayload::ConnectionStateChanged {
                queue: self.queue_name().to_string(),
                state,
            },
        );
    }

    fn emit_connection_lost(&self, reason: String, will_retry: bool) {
        self.emit(
            "broker.connection.lost",
            EventPayload::ConnectionLost {
                queue: self.queue_name().to_string(),
                reason,
                will_retry,
            },
        );
    }

    fn emit_reconnecting(&self, attempt: u32, delay: Duration) {
        self.emit(
            "broker.connection.reconnecting",
            EventPayload::ConnectionReconnecting {
                queue: self.queue_name().to_string(),
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            },
        );
    }

    fn emit(&self, channel: &str, payload: EventPayload) {
        if let Some(event_bus) = &self.inner.event_bus {
            emit(
                event_bus.as_ref(),
                channel,
                EventSource::Broker(self.queue_name().to_string()),
                payload,
            );
        }
    }
}

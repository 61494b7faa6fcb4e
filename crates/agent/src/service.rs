//! Sync service: one broker consumer for one owner, guarded by the
//! lifecycle state machine.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use syncwire_broker::{
    AmqpTransport, BrokerConnection, BrokerTransport, ConnectionSettings, ConnectionStats,
    DeliveryHandler,
};
use syncwire_core::config::Config;
use syncwire_core::event::{EventBus, EventPayload, EventSubscription};
use syncwire_core::network::NetworkMonitor;
use syncwire_core::{ConnectionIdentity, LinkState};
use syncwire_lifecycle::{
    ConnectionState, ConnectionStateManager, RegistryEntry, StateStatistics,
};
use syncwire_storage::ConfirmationLog;
use syncwire_sync::{ContactWriter, MessageProcessor, OutboundRetryStore, ProcessorSettings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Logical connection key used by the state manager.
    pub key: String,
    pub owner_id: String,
    pub connection: ConnectionSettings,
    pub processor: ProcessorSettings,
    pub replay_interval: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            key: format!("contacts:{}", config.device.owner_id),
            owner_id: config.device.owner_id.clone(),
            connection: ConnectionSettings::from_config(config),
            processor: ProcessorSettings::from_config(config),
            replay_interval: config.processing.replay_interval(),
        }
    }
}

/// Shared collaborators handed to the service.
pub struct ServiceParts<W, L> {
    pub writer: Arc<W>,
    pub log: Arc<L>,
    pub network: Arc<dyn NetworkMonitor>,
    pub state: Arc<ConnectionStateManager>,
    pub event_bus: Arc<dyn EventBus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The consumer is live.
    Connected,
    /// Setup was accepted but the first attempt failed; the connection keeps
    /// retrying in the background.
    Retrying,
    /// The key or queue is busy, or the registry is cooling down.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatistics {
    pub connection: ConnectionStats,
    pub lifecycle: StateStatistics,
    pub registry: Vec<RegistryEntry>,
    pub pending_confirmations: Option<u64>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncService<W, L, T: BrokerTransport = AmqpTransport> {
    identity: ConnectionIdentity,
    state: Arc<ConnectionStateManager>,
    connection: Arc<BrokerConnection<T>>,
    processor: Arc<MessageProcessor<W, BrokerConnection<T>, L>>,
    retry_store: Arc<OutboundRetryStore<L>>,
    event_bus: Arc<dyn EventBus>,
    running: Mutex<Option<Running>>,
}

impl<W, L, T> SyncService<W, L, T>
where
    W: ContactWriter,
    L: ConfirmationLog,
    T: BrokerTransport,
{
    pub fn new(settings: ServiceSettings, parts: ServiceParts<W, L>) -> Self {
        let identity = ConnectionIdentity::new(
            settings.key,
            settings.owner_id,
            settings.connection.topology.inbound_queue.clone(),
        );
        let connection = Arc::new(BrokerConnection::with_event_bus(
            settings.connection,
            parts.network,
            Arc::clone(&parts.event_bus),
        ));
        let retry_store = Arc::new(
            OutboundRetryStore::new(parts.log).with_sweep_interval(settings.replay_interval),
        );
        let processor = Arc::new(
            MessageProcessor::new(
                parts.writer,
                Arc::clone(&connection),
                Arc::clone(&retry_store),
                settings.processor,
            )
            .with_event_bus(Arc::clone(&parts.event_bus)),
        );

        Self {
            identity,
            state: parts.state,
            connection,
            processor,
            retry_store,
            event_bus: parts.event_bus,
            running: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn connection(&self) -> &Arc<BrokerConnection<T>> {
        &self.connection
    }

    /// Claim the queue and start consuming.
    pub async fn start(&self) -> StartOutcome {
        let identity = &self.identity;
        if !self.state.try_start_connection_setup(
            &identity.key,
            &identity.owner_id,
            &identity.queue_name,
        ) {
            info!(%identity, "connection setup rejected");
            return StartOutcome::Rejected;
        }

        // Subscribe before connecting so the first state change is seen.
        let states = match self.event_bus.subscribe("broker.connection.state") {
            Ok(states) => states,
            Err(error) => {
                warn!(%error, "cannot watch connection state");
                self.state
                    .mark_connection_failed(&identity.key, &error.to_string());
                return StartOutcome::Rejected;
            }
        };

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(mirror_link_state(
                Arc::clone(&self.state),
                Arc::clone(&self.connection),
                identity.clone(),
                states,
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.retry_store).run(
                Arc::clone(&self.connection),
                Arc::clone(&self.event_bus),
                cancel.clone(),
            )),
        ];
        if let Some(previous) = lock(&self.running).replace(Running { cancel, tasks }) {
            previous.cancel.cancel();
        }

        let handler: Arc<dyn DeliveryHandler> = self.processor.clone();
        if self.connection.connect(handler).await {
            self.state.mark_connection_established(&identity.key);
            info!(%identity, "sync service started");
            StartOutcome::Connected
        } else {
            info!(%identity, "first connection attempt failed, retrying in background");
            StartOutcome::Retrying
        }
    }

    /// Tear down the consumer and release the queue. The queue stays claimed
    /// until the session is fully closed.
    pub async fn stop(&self) {
        let key = &self.identity.key;
        let cleaning = self.state.start_cleanup(key);

        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            for task in running.tasks {
                if let Err(error) = task.await {
                    warn!(%error, "background task ended abnormally");
                }
            }
        }

        self.connection.disconnect().await;
        if cleaning {
            self.state.mark_cleanup_complete(key);
        }
        info!(identity = %self.identity, "sync service stopped");
    }

    /// Connectivity came back; reconnect now rather than at the next backoff.
    ///
    /// A connection that gave up has released its queue, so the queue is
    /// claimed again before the link is re-established. Returns `false`
    /// without reconnecting when another key holds it meanwhile.
    pub async fn on_network_available(&self) -> bool {
        if lock(&self.running).is_none() {
            return false;
        }

        let identity = &self.identity;
        if self.state.get_state(&identity.key) == ConnectionState::Error
            && !self.state.try_start_connection_setup(
                &identity.key,
                &identity.owner_id,
                &identity.queue_name,
            )
        {
            info!(%identity, "queue is held elsewhere, not reconnecting");
            return false;
        }

        let connected = self.connection.on_network_available().await;
        if connected {
            self.state.mark_connection_established(&identity.key);
        } else if matches!(
            self.connection.state(),
            LinkState::Error | LinkState::Disconnected
        ) {
            self.state
                .mark_connection_failed(&identity.key, "broker connection unavailable");
        }
        connected
    }

    pub async fn statistics(&self) -> ServiceStatistics {
        let pending_confirmations = match self.retry_store.pending_count().await {
            Ok(count) => Some(count),
            Err(error) => {
                debug!(%error, "pending confirmation count unavailable");
                None
            }
        };
        ServiceStatistics {
            connection: self.connection.get_connection_stats(),
            lifecycle: self.state.get_statistics(),
            registry: self.state.registry().snapshot(),
            pending_confirmations,
        }
    }
}

async fn mirror_link_state<T: BrokerTransport>(
    state: Arc<ConnectionStateManager>,
    connection: Arc<BrokerConnection<T>>,
    identity: ConnectionIdentity,
    mut states: EventSubscription,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = states.recv() => received,
        };
        match received {
            Ok(event) => {
                if let EventPayload::ConnectionStateChanged { queue, state: link } = event.payload {
                    // Another service on the same queue publishes on the same
                    // channel; only our own connection's current state counts.
                    if queue != identity.queue_name || connection.state() != link {
                        continue;
                    }
                    if !apply_link_state(&state, &identity, link) {
                        warn!(%identity, "link is up without a queue claim, disconnecting");
                        connection.disconnect().await;
                    }
                }
            }
            Err(syncwire_core::EventBusError::Lagged(missed)) => {
                debug!(missed, "connection state events lagged");
            }
            Err(_) => break,
        }
    }
}

/// Follow the broker link in the lifecycle record. Reconnects keep the
/// record `Connected` so the queue stays claimed; only a connection that
/// gave up releases it.
///
/// Returns `false` when the link came up but the queue could not be
/// claimed for it, in which case the consumer must not stay live.
fn apply_link_state(
    state: &ConnectionStateManager,
    identity: &ConnectionIdentity,
    link: LinkState,
) -> bool {
    let key = &identity.key;
    match link {
        LinkState::Connected => match state.get_state(key) {
            ConnectionState::SettingUp => {
                state.mark_connection_established(key);
            }
            ConnectionState::Error => {
                if state.try_start_connection_setup(key, &identity.owner_id, &identity.queue_name)
                {
                    state.mark_connection_established(key);
                } else {
                    return false;
                }
            }
            _ => {}
        },
        LinkState::Error => {
            state.mark_connection_failed(key, "broker connection gave up");
        }
        _ => {}
    }
    true
}

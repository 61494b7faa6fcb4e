use std::sync::Arc;
use std::time::Duration;

use syncwire_agent::{ServiceParts, ServiceSettings, StartOutcome, SyncService};
use syncwire_broker::BrokerError;
use syncwire_core::event::{BroadcastEventBus, EventBus};
use syncwire_core::network::ManualNetworkMonitor;
use syncwire_lifecycle::{ConnectionRegistry, ConnectionState, ConnectionStateManager};
use syncwire_storage::MemoryConfirmationLog;
use syncwire_sync::ProcessorSettings;
use syncwire_test_support::{MockBroker, MockTransport, RecordingWriter, fixtures, init_tracing};

const WAIT: Duration = Duration::from_secs(5);

type Service = SyncService<RecordingWriter, MemoryConfirmationLog, MockTransport>;

struct Shared {
    state: Arc<ConnectionStateManager>,
    event_bus: Arc<dyn EventBus>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Arc::new(ConnectionStateManager::new(Arc::new(
                ConnectionRegistry::new(Duration::ZERO),
            ))),
            event_bus: Arc::new(BroadcastEventBus::default()),
        }
    }

    fn service(&self, broker: &MockBroker, key: &str, owner: &str, queue: &str) -> Service {
        self.service_with_writer(broker, key, owner, queue, Arc::new(RecordingWriter::new()))
    }

    fn service_with_writer(
        &self,
        broker: &MockBroker,
        key: &str,
        owner: &str,
        queue: &str,
        writer: Arc<RecordingWriter>,
    ) -> Service {
        SyncService::new(
            ServiceSettings {
                key: key.to_string(),
                owner_id: owner.to_string(),
                connection: broker.connection_settings(queue),
                processor: ProcessorSettings {
                    device_id: "device-test".to_string(),
                    sla_threshold: Duration::from_secs(20),
                    idempotency_window: 16,
                },
                replay_interval: Duration::from_secs(30),
            },
            ServiceParts {
                writer,
                log: Arc::new(MemoryConfirmationLog::new()),
                network: Arc::new(ManualNetworkMonitor::online()),
                state: Arc::clone(&self.state),
                event_bus: Arc::clone(&self.event_bus),
            },
        )
    }

    async fn wait_for_state(&self, key: &str, expected: ConnectionState) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.state.get_state(key) == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[tokio::test]
async fn start_claims_the_queue_and_stop_releases_it() {
    init_tracing();
    let broker = MockBroker::start();
    let shared = Shared::new();
    let service = shared.service(&broker, "contacts:o1", "o1", "contacts.o1");

    assert_eq!(service.start().await, StartOutcome::Connected);
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Connected);
    assert_eq!(shared.state.registry().active_count("contacts.o1"), 1);
    assert_eq!(broker.active_consumers(), 1);

    service.stop().await;
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Idle);
    assert_eq!(shared.state.registry().active_count("contacts.o1"), 0);
    assert_eq!(broker.active_consumers(), 0);
    assert!(!service.connection().is_connected());
}

#[tokio::test]
async fn second_key_on_the_same_queue_is_rejected() {
    init_tracing();
    let broker = MockBroker::start();
    let shared = Shared::new();
    let first = shared.service(&broker, "contacts:o1", "o1", "contacts.shared");
    let second = shared.service(&broker, "contacts:o2", "o2", "contacts.shared");

    assert_eq!(first.start().await, StartOutcome::Connected);
    assert_eq!(second.start().await, StartOutcome::Rejected);
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.max_concurrent_consumers(), 1);

    first.stop().await;
    assert_eq!(second.start().await, StartOutcome::Connected);
    assert_eq!(broker.max_concurrent_consumers(), 1);
    second.stop().await;
}

#[tokio::test]
async fn starting_twice_is_a_no_op() {
    init_tracing();
    let broker = MockBroker::start();
    let shared = Shared::new();
    let service = shared.service(&broker, "contacts:o1", "o1", "contacts.o1");

    assert_eq!(service.start().await, StartOutcome::Connected);
    assert_eq!(service.start().await, StartOutcome::Rejected);
    assert_eq!(broker.connect_count(), 1);

    service.stop().await;
    service.stop().await;
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Idle);
}

#[tokio::test]
async fn late_connection_completes_setup_in_background() {
    init_tracing();
    let broker = MockBroker::start();
    broker.fail_next_connects([BrokerError::ConnectionRefused("not yet".to_string())]);
    let shared = Shared::new();
    let service = shared.service(&broker, "contacts:o1", "o1", "contacts.o1");

    assert_eq!(service.start().await, StartOutcome::Retrying);
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::SettingUp);

    assert!(
        shared
            .wait_for_state("contacts:o1", ConnectionState::Connected)
            .await
    );
    assert_eq!(shared.state.registry().active_count("contacts.o1"), 1);

    service.stop().await;
}

#[tokio::test]
async fn giving_up_moves_the_record_to_error() {
    init_tracing();
    let broker = MockBroker::start();
    broker.fail_next_connects(
        (0..4).map(|_| BrokerError::AuthenticationFailed("bad credentials".to_string())),
    );
    let shared = Shared::new();
    let service = shared.service(&broker, "contacts:o1", "o1", "contacts.o1");

    assert_eq!(service.start().await, StartOutcome::Retrying);
    assert!(
        shared
            .wait_for_state("contacts:o1", ConnectionState::Error)
            .await
    );
    let record = shared.state.get_record("contacts:o1").unwrap();
    assert_eq!(record.last_error.as_deref(), Some("broker connection gave up"));

    service.stop().await;
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Idle);
}

#[tokio::test]
async fn deliveries_are_processed_and_counted() {
    init_tracing();
    let broker = MockBroker::start();
    let shared = Shared::new();
    let service = shared.service(&broker, "contacts:o1", "o1", "contacts.o1");
    assert_eq!(service.start().await, StartOutcome::Connected);

    let tag = broker.deliver(fixtures::contact("create-full.json")).unwrap();
    assert!(broker.wait_for_settled(1, WAIT).await);
    assert_eq!(broker.acks(), vec![tag]);
    assert_eq!(broker.published().len(), 1);

    let stats = service.statistics().await;
    assert_eq!(stats.connection.deliveries_received, 1);
    assert_eq!(stats.lifecycle.connected, 1);
    assert_eq!(stats.pending_confirmations, Some(0));
    assert_eq!(stats.registry.len(), 1);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["lifecycle"]["connected"], 1);
    assert_eq!(json["connection"]["queue"], "contacts.o1");

    service.stop().await;
}

#[tokio::test]
async fn recovery_after_giving_up_respects_the_new_holder() {
    init_tracing();
    let broker = MockBroker::start();
    broker.fail_next_connects(
        (0..4).map(|_| BrokerError::AuthenticationFailed("bad credentials".to_string())),
    );
    let shared = Shared::new();
    let first = shared.service(&broker, "contacts:o1", "o1", "contacts.shared");
    let second = shared.service(&broker, "contacts:o2", "o2", "contacts.shared");

    assert_eq!(first.start().await, StartOutcome::Retrying);
    assert!(
        shared
            .wait_for_state("contacts:o1", ConnectionState::Error)
            .await
    );
    assert_eq!(second.start().await, StartOutcome::Connected);

    assert!(!first.on_network_available().await);
    assert!(!first.connection().is_connected());
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Error);
    assert_eq!(broker.active_consumers(), 1);
    assert_eq!(broker.max_concurrent_consumers(), 1);

    second.stop().await;
    assert!(first.on_network_available().await);
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Connected);
    assert_eq!(shared.state.registry().active_count("contacts.shared"), 1);
    assert_eq!(broker.max_concurrent_consumers(), 1);

    first.stop().await;
}

#[tokio::test]
async fn queue_is_held_until_stop_finishes() {
    init_tracing();
    let broker = MockBroker::start();
    let shared = Shared::new();
    let writer = Arc::new(RecordingWriter::new());
    writer.set_delay(Some(Duration::from_millis(400)));
    let first = shared.service_with_writer(
        &broker,
        "contacts:o1",
        "o1",
        "contacts.shared",
        Arc::clone(&writer),
    );
    let second = shared.service(&broker, "contacts:o2", "o2", "contacts.shared");

    assert_eq!(first.start().await, StartOutcome::Connected);
    let tag = broker.deliver(fixtures::contact("create-full.json")).unwrap();
    assert!(broker.wait_until(WAIT, |_| writer.calls() == 1).await);

    let ((), racing) = tokio::join!(first.stop(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        second.start().await
    });
    assert_eq!(racing, StartOutcome::Rejected);
    assert_eq!(broker.max_concurrent_consumers(), 1);
    assert_eq!(writer.applied().len(), 1);
    assert_eq!(broker.acks(), vec![tag]);
    assert_eq!(shared.state.get_state("contacts:o1"), ConnectionState::Idle);

    assert_eq!(second.start().await, StartOutcome::Connected);
    assert_eq!(broker.max_concurrent_consumers(), 1);
    second.stop().await;
}

//! Contact processing end to end over the mock broker with a SQLite-backed
//! retry store.

use std::sync::Arc;
use std::time::Duration;

use syncwire_broker::{BrokerConnection, BrokerError};
use syncwire_core::event::{BroadcastEventBus, EventBus};
use syncwire_core::network::ManualNetworkMonitor;
use syncwire_storage::SqliteConfirmationLog;
use syncwire_sync::{
    ConfirmationPayload, ConfirmationStatus, MessageProcessor, OutboundRetryStore,
    ProcessorSettings, WriteError,
};
use syncwire_test_support::{
    MockBroker, MockTransport, RecordingPublisher, RecordingWriter, fixtures, init_tracing,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

type Processor =
    MessageProcessor<RecordingWriter, BrokerConnection<MockTransport>, SqliteConfirmationLog>;

struct Harness {
    broker: Arc<MockBroker>,
    bus: Arc<BroadcastEventBus>,
    connection: Arc<BrokerConnection<MockTransport>>,
    writer: Arc<RecordingWriter>,
    retry_store: Arc<OutboundRetryStore<SqliteConfirmationLog>>,
    _dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteConfirmationLog::open(&dir.path().join("confirmations.db"))
            .await
            .unwrap();

        let broker = MockBroker::start();
        let bus = Arc::new(BroadcastEventBus::default());
        let connection = Arc::new(BrokerConnection::<MockTransport>::with_event_bus(
            broker.connection_settings("contacts.owner-1"),
            Arc::new(ManualNetworkMonitor::online()),
            bus.clone(),
        ));
        let writer = Arc::new(RecordingWriter::new());
        let retry_store = Arc::new(OutboundRetryStore::new(Arc::new(log)));

        let processor: Processor = MessageProcessor::new(
            Arc::clone(&writer),
            Arc::clone(&connection),
            Arc::clone(&retry_store),
            ProcessorSettings {
                device_id: "device-test".to_string(),
                sla_threshold: Duration::from_secs(20),
                idempotency_window: 64,
            },
        )
        .with_event_bus(bus.clone());

        assert!(connection.connect(Arc::new(processor)).await);

        Self {
            broker,
            bus,
            connection,
            writer,
            retry_store,
            _dir: dir,
        }
    }

    fn confirmations(&self) -> Vec<ConfirmationPayload> {
        self.broker
            .published()
            .iter()
            .map(|message| serde_json::from_slice(&message.payload).unwrap())
            .collect()
    }

    async fn stop(self) {
        self.connection.disconnect().await;
    }
}

#[tokio::test]
async fn contact_change_is_applied_and_confirmed() {
    let harness = Harness::start().await;

    let tag = harness
        .broker
        .deliver(fixtures::contact("create-full.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(1, WAIT).await);

    assert_eq!(harness.broker.acks(), vec![tag]);
    let applied = harness.writer.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].id, "test_5f3a9c21");

    let confirmations = harness.confirmations();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].contact_id, "test_5f3a9c21");
    assert_eq!(confirmations[0].status, ConfirmationStatus::Success);
    assert_eq!(confirmations[0].device_id, "device-test");
    assert_eq!(confirmations[0].local_contact_id.as_deref(), Some("1"));
    assert_eq!(harness.retry_store.pending_count().await.unwrap(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn malformed_payload_is_acked_without_side_effects() {
    let harness = Harness::start().await;

    let tag = harness
        .broker
        .deliver(fixtures::contact("malformed.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(1, WAIT).await);

    assert_eq!(harness.broker.acks(), vec![tag]);
    assert_eq!(harness.writer.calls(), 0);
    assert!(harness.broker.published().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn transient_write_failure_is_requeued_then_applied_once() {
    let harness = Harness::start().await;
    harness
        .writer
        .fail_next(WriteError::Transient("contacts provider busy".to_string()));

    let first = harness
        .broker
        .deliver(fixtures::contact("create-full.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(1, WAIT).await);
    assert_eq!(harness.broker.nacks(), vec![(first, true)]);
    assert!(harness.broker.published().is_empty());

    let second = harness
        .broker
        .deliver(fixtures::contact("create-full.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(2, WAIT).await);
    assert_eq!(harness.broker.acks(), vec![second]);
    assert_eq!(harness.writer.applied().len(), 1);
    assert_eq!(harness.confirmations().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn redelivered_change_is_confirmed_again_without_rewriting() {
    let harness = Harness::start().await;

    harness
        .broker
        .deliver(fixtures::contact("delete.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(1, WAIT).await);
    harness
        .broker
        .deliver(fixtures::contact("delete.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(2, WAIT).await);

    assert_eq!(harness.writer.calls(), 1);
    let confirmations = harness.confirmations();
    assert_eq!(confirmations.len(), 2);
    assert_eq!(confirmations[0], confirmations[1]);

    harness.stop().await;
}

#[tokio::test]
async fn permanent_write_failure_is_reported_and_acked() {
    let harness = Harness::start().await;
    harness
        .writer
        .fail_next(WriteError::Permanent("read-only account".to_string()));

    let tag = harness
        .broker
        .deliver(fixtures::contact("create-full.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(1, WAIT).await);

    assert_eq!(harness.broker.acks(), vec![tag]);
    let confirmations = harness.confirmations();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].status, ConfirmationStatus::Error);
    assert_eq!(confirmations[0].error.as_deref(), Some("read-only account"));

    harness.stop().await;
}

#[tokio::test]
async fn failed_confirmation_is_replayed_after_reconnect() {
    let harness = Harness::start().await;

    harness.broker.fail_next_publishes(1);
    let tag = harness
        .broker
        .deliver(fixtures::contact("create-full.json"))
        .unwrap();
    assert!(harness.broker.wait_for_settled(1, WAIT).await);
    assert_eq!(harness.broker.acks(), vec![tag]);
    assert!(harness.broker.published().is_empty());
    assert_eq!(harness.retry_store.pending_count().await.unwrap(), 1);

    // Keep the broker away long enough for the sweeper to start while the
    // link is down.
    harness.broker.fail_next_connects(
        (0..3).map(|_| BrokerError::ConnectionRefused("broker restarting".to_string())),
    );
    harness.broker.shutdown(false, "connection reset by peer");
    assert!(
        harness
            .broker
            .wait_until(WAIT, |_| !harness.connection.is_connected())
            .await
    );

    let cancel = CancellationToken::new();
    let bus: Arc<dyn EventBus> = harness.bus.clone();
    let sweeper = tokio::spawn(Arc::clone(&harness.retry_store).run(
        Arc::clone(&harness.connection),
        bus,
        cancel.clone(),
    ));

    assert!(
        harness
            .broker
            .wait_until(WAIT, |broker| broker.published().len() == 1)
            .await
    );
    assert_eq!(harness.confirmations()[0].contact_id, "test_5f3a9c21");

    let deadline = tokio::time::Instant::now() + WAIT;
    while harness.retry_store.pending_count().await.unwrap() > 0
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.retry_store.pending_count().await.unwrap(), 0);

    cancel.cancel();
    sweeper.await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn pending_confirmations_survive_restart_in_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("confirmations.db");

    {
        let log = SqliteConfirmationLog::open(&path).await.unwrap();
        let store = OutboundRetryStore::new(Arc::new(log));
        for n in 1..=3 {
            store.enqueue(format!("{{\"n\":{n}}}").into_bytes()).await.unwrap();
        }
    }

    let log = SqliteConfirmationLog::open(&path).await.unwrap();
    let store = OutboundRetryStore::new(Arc::new(log));
    assert_eq!(store.pending_count().await.unwrap(), 3);

    let publisher = RecordingPublisher::new();
    let report = store.replay_pending(&publisher).await.unwrap();

    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(
        publisher.published(),
        vec![
            b"{\"n\":1}".to_vec(),
            b"{\"n\":2}".to_vec(),
            b"{\"n\":3}".to_vec()
        ]
    );
}

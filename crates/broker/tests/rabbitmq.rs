//! End-to-end check against a real RabbitMQ broker.
//!
//! Needs Docker. Run with:
//! `cargo test -p syncwire-broker --test rabbitmq -- --ignored`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use syncwire_broker::{BrokerConnection, ConnectionSettings, Topology, handler_fn};
use syncwire_core::network::ManualNetworkMonitor;
use syncwire_test_support::{RabbitMq, init_tracing};

fn settings(rabbit: &RabbitMq, inbound: &str, confirmations: &str) -> ConnectionSettings {
    ConnectionSettings {
        broker: rabbit.broker_config(),
        topology: Topology {
            exchange: String::new(),
            inbound_queue: inbound.to_string(),
            inbound_routing_key: inbound.to_string(),
            confirmation_queue: confirmations.to_string(),
            confirmation_routing_key: confirmations.to_string(),
        },
        prefetch: 50,
        constrained_prefetch: 10,
        channel_capacity: 32,
        handler_timeout: Duration::from_secs(5),
        publish_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        auto_reconnect: true,
        graceful_shutdown_cooldown: Duration::from_secs(1),
        max_reconnect_delay: Some(Duration::from_secs(1)),
        network_wait: Duration::from_secs(1),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publishes_reach_the_peer_consumer() {
    init_tracing();
    let rabbit = RabbitMq::start().await.expect("rabbitmq container");

    // The sender's confirmation queue is the receiver's inbound queue.
    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let sink = Arc::clone(&received);
    let receiver: BrokerConnection = BrokerConnection::new(
        settings(&rabbit, "e2e.receiver", "e2e.unused"),
        Arc::new(ManualNetworkMonitor::online()),
    );
    assert!(
        receiver
            .connect(Arc::new(handler_fn(move |payload: Vec<u8>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(payload);
                    Ok(true)
                }
            })))
            .await
    );

    let sender: BrokerConnection = BrokerConnection::new(
        settings(&rabbit, "e2e.sender", "e2e.receiver"),
        Arc::new(ManualNetworkMonitor::online()),
    );
    assert!(
        sender
            .connect(Arc::new(handler_fn(|_payload: Vec<u8>| async { Ok(true) })))
            .await
    );

    assert!(sender.publish(br#"{"contact_id":"e2e"}"#.to_vec()).await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        received.lock().unwrap().as_slice(),
        &[br#"{"contact_id":"e2e"}"#.to_vec()]
    );
    assert_eq!(receiver.get_connection_stats().deliveries_received, 1);

    sender.disconnect().await;
    receiver.disconnect().await;
}

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::handler::DeliveryHandler;
use crate::transport::RawDelivery;
use crate::worker::{AckAction, AckOutcome};

/// Hand each inbound delivery to the handler on its own task and report the
/// verdict back to the worker. On cancellation, buffered deliveries are
/// requeued and in-flight handlers run to completion so their outcomes are
/// still settled.
pub(crate) async fn run_dispatch(
    mut inbound_rx: mpsc::Receiver<RawDelivery>,
    ack_tx: mpsc::UnboundedSender<AckOutcome>,
    handler: Arc<dyn DeliveryHandler>,
    handler_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = in_flight.join_next() => log_join(joined),
            delivery = inbound_rx.recv() => match delivery {
                Some(delivery) => {
                    in_flight.spawn(handle_delivery(
                        Arc::clone(&handler),
                        delivery,
                        ack_tx.clone(),
                        handler_timeout,
                    ));
                }
                None => break,
            },
        }
    }

    inbound_rx.close();
    let mut requeued = 0usize;
    while let Ok(delivery) = inbound_rx.try_recv() {
        let outcome = AckOutcome {
            delivery_tag: delivery.delivery_tag,
            action: AckAction::Nack { requeue: true },
        };
        if ack_tx.send(outcome).is_err() {
            break;
        }
        requeued += 1;
    }
    if requeued > 0 {
        debug!(requeued, "returned buffered deliveries to the queue");
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        if !error.is_cancelled() {
            error!(%error, "delivery task failed");
        }
    }
}

async fn handle_delivery(
    handler: Arc<dyn DeliveryHandler>,
    delivery: RawDelivery,
    ack_tx: mpsc::UnboundedSender<AckOutcome>,
    handler_timeout: Duration,
) {
    let delivery_tag = delivery.delivery_tag;
    let handled = tokio::time::timeout(
        handler_timeout,
        AssertUnwindSafe(handler.handle(&delivery.payload)).catch_unwind(),
    )
    .await;

    let action = match handled {
        Ok(Ok(Ok(true))) => AckAction::Ack,
        Ok(Ok(Ok(false))) => {
            debug!(delivery_tag, "handler declined delivery");
            AckAction::Nack { requeue: true }
        }
        Ok(Ok(Err(error))) => {
            warn!(delivery_tag, %error, "handler failed");
            AckAction::Nack { requeue: true }
        }
        Ok(Err(_)) => {
            error!(delivery_tag, "handler panicked");
            AckAction::Nack { requeue: true }
        }
        Err(_) => {
            warn!(delivery_tag, timeout = ?handler_timeout, "handler timed out");
            AckAction::Nack { requeue: true }
        }
    };

    if ack_tx.send(AckOutcome { delivery_tag, action }).is_err() {
        debug!(delivery_tag, "session closed before delivery was settled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::handler_fn;

    fn delivery(tag: u64, payload: &[u8]) -> RawDelivery {
        RawDelivery {
            delivery_tag: tag,
            payload: payload.to_vec(),
            redelivered: false,
        }
    }

    struct Harness {
        inbound_tx: mpsc::Sender<RawDelivery>,
        ack_rx: mpsc::UnboundedReceiver<AckOutcome>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(handler: Arc<dyn DeliveryHandler>, timeout: Duration) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_dispatch(
            inbound_rx,
            ack_tx,
            handler,
            timeout,
            cancel.clone(),
        ));
        Harness {
            inbound_tx,
            ack_rx,
            cancel,
            task,
        }
    }

    #[tokio::test]
    async fn verdicts_map_to_ack_or_requeue() {
        let handler = Arc::new(handler_fn(|payload: Vec<u8>| async move {
            match payload.as_slice() {
                b"ok" => Ok(true),
                b"decline" => Ok(false),
                b"panic" => panic!("handler blew up"),
                _ => Err(HandlerError::new("bad payload")),
            }
        }));
        let mut harness = start(handler, Duration::from_secs(5));

        for (tag, payload) in [(1, b"ok".as_slice()), (2, b"decline"), (3, b"err"), (4, b"panic")] {
            harness.inbound_tx.send(delivery(tag, payload)).await.unwrap();
        }

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(harness.ack_rx.recv().await.unwrap());
        }
        outcomes.sort_by_key(|outcome| outcome.delivery_tag);

        assert_eq!(outcomes[0].action, AckAction::Ack);
        for outcome in &outcomes[1..] {
            assert_eq!(outcome.action, AckAction::Nack { requeue: true });
        }

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn slow_handler_is_nacked_after_timeout() {
        let handler = Arc::new(handler_fn(|_payload: Vec<u8>| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(true)
        }));
        let mut harness = start(handler, Duration::from_millis(50));

        harness.inbound_tx.send(delivery(7, b"slow")).await.unwrap();
        let outcome = harness.ack_rx.recv().await.unwrap();
        assert_eq!(
            outcome,
            AckOutcome {
                delivery_tag: 7,
                action: AckAction::Nack { requeue: true }
            }
        );

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_waits_for_in_flight_handlers() {
        let handler = Arc::new(handler_fn(|_payload: Vec<u8>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(true)
        }));
        let mut harness = start(handler, Duration::from_secs(5));

        harness.inbound_tx.send(delivery(1, b"x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.cancel.cancel();
        harness.task.await.unwrap();

        let outcome = harness.ack_rx.recv().await.unwrap();
        assert_eq!(outcome.action, AckAction::Ack);
    }

    #[tokio::test]
    async fn buffered_deliveries_are_requeued_on_cancel() {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        for tag in 1..=3 {
            inbound_tx.send(delivery(tag, b"queued")).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handler = Arc::new(handler_fn(|_payload: Vec<u8>| async move { Ok(true) }));
        run_dispatch(inbound_rx, ack_tx, handler, Duration::from_secs(5), cancel).await;

        let mut outcomes = Vec::new();
        while let Ok(outcome) = ack_rx.try_recv() {
            outcomes.push(outcome);
        }
        assert_eq!(
            outcomes,
            (1..=3)
                .map(|delivery_tag| AckOutcome {
                    delivery_tag,
                    action: AckAction::Nack { requeue: true },
                })
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn closed_inbound_channel_ends_dispatch() {
        let handler = Arc::new(handler_fn(|_payload: Vec<u8>| async move { Ok(true) }));
        let harness = start(handler, Duration::from_secs(5));

        drop(harness.inbound_tx);
        harness.task.await.unwrap();
    }
}

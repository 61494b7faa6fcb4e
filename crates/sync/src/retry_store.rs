//! Durable queue for confirmations that could not be published.
//!
//! Entries are replayed strictly oldest-first. A sweep stops at the first
//! failed publish so later confirmations never overtake an earlier one.

use std::sync::Arc;
use std::time::Duration;

use syncwire_core::event::{EventBus, EventPayload, EventSource, emit};
use syncwire_core::{EventBusError, LinkState};
use syncwire_storage::{ConfirmationLog, StoredConfirmation};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::publisher::ConfirmationPublisher;

const REPLAY_BATCH: usize = 64;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: u64,
    /// The sweep stopped early because a publish failed or the connection
    /// dropped.
    pub halted: bool,
    /// Another sweep was already running; this one did nothing.
    pub coalesced: bool,
}

pub struct OutboundRetryStore<L> {
    log: Arc<L>,
    sweep: tokio::sync::Mutex<()>,
    sweep_interval: Option<Duration>,
}

impl<L: ConfirmationLog> OutboundRetryStore<L> {
    pub fn new(log: Arc<L>) -> Self {
        Self {
            log,
            sweep: tokio::sync::Mutex::new(()),
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }

    /// Period of the background sweep while connected. Zero turns the
    /// periodic sweep off, leaving only the sweeps on reconnect.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub async fn enqueue(&self, payload: Vec<u8>) -> Result<StoredConfirmation, SyncError> {
        let stored = self.log.append(payload).await?;
        debug!(id = stored.id, "confirmation queued for replay");
        Ok(stored)
    }

    pub async fn pending_count(&self) -> Result<u64, SyncError> {
        Ok(self.log.pending_count().await?)
    }

    /// Publish pending confirmations in enqueue order until the log is empty
    /// or a publish fails.
    pub async fn replay_pending<P: ConfirmationPublisher>(
        &self,
        publisher: &P,
    ) -> Result<ReplayReport, SyncError> {
        let Ok(_sweep) = self.sweep.try_lock() else {
            debug!("replay sweep already running");
            return Ok(ReplayReport {
                coalesced: true,
                ..ReplayReport::default()
            });
        };

        let mut replayed = 0;
        let mut halted = false;

        'sweep: loop {
            let batch = self.log.pending(REPLAY_BATCH).await?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                if !publisher.is_connected() {
                    halted = true;
                    break 'sweep;
                }

                self.log.record_attempt(entry.id).await?;
                if !publisher.publish_confirmation(entry.payload).await {
                    warn!(
                        id = entry.id,
                        attempts = entry.attempts + 1,
                        "confirmation replay failed, halting sweep"
                    );
                    halted = true;
                    break 'sweep;
                }
                self.log.mark_sent(entry.id).await?;
                replayed += 1;
            }
        }

        let purged = self.log.purge_sent().await?;
        let remaining = self.log.pending_count().await?;
        debug!(replayed, purged, remaining, halted, "replay sweep finished");

        Ok(ReplayReport {
            replayed,
            remaining,
            halted,
            coalesced: false,
        })
    }

    /// Sweep whenever the connection reports `Connected`, and periodically
    /// while it stays connected, until cancelled.
    pub async fn run<P: ConfirmationPublisher>(
        self: Arc<Self>,
        publisher: Arc<P>,
        event_bus: Arc<dyn EventBus>,
        cancel: CancellationToken,
    ) {
        let mut subscription = match event_bus.subscribe("broker.connection.state") {
            Ok(subscription) => subscription,
            Err(error) => {
                warn!(%error, "cannot watch connection state, replay disabled");
                return;
            }
        };

        if publisher.is_connected() {
            self.sweep_and_report(publisher.as_ref(), event_bus.as_ref())
                .await;
        }

        let mut ticker = self.sweep_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut ticker) => {
                    if publisher.is_connected() {
                        self.sweep_and_report(publisher.as_ref(), event_bus.as_ref())
                            .await;
                    }
                    continue;
                }
                received = subscription.recv() => received,
            };

            match received {
                Ok(event) => {
                    if let EventPayload::ConnectionStateChanged {
                        state: LinkState::Connected,
                        ..
                    } = event.payload
                    {
                        self.sweep_and_report(publisher.as_ref(), event_bus.as_ref())
                            .await;
                    }
                }
                Err(EventBusError::Lagged(missed)) => {
                    debug!(missed, "state events lagged");
                    if publisher.is_connected() {
                        self.sweep_and_report(publisher.as_ref(), event_bus.as_ref())
                            .await;
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn sweep_and_report<P: ConfirmationPublisher>(
        &self,
        publisher: &P,
        event_bus: &dyn EventBus,
    ) {
        match self.replay_pending(publisher).await {
            Ok(report) if report.replayed > 0 => {
                info!(
                    replayed = report.replayed,
                    remaining = report.remaining,
                    "replayed queued confirmations"
                );
                emit(
                    event_bus,
                    "sync.confirmation.replayed",
                    EventSource::Sync,
                    EventPayload::ConfirmationsReplayed {
                        replayed: report.replayed,
                        remaining: usize::try_from(report.remaining).unwrap_or(usize::MAX),
                    },
                );
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "confirmation replay failed"),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use syncwire_core::event::BroadcastEventBus;
    use syncwire_storage::MemoryConfirmationLog;

    #[derive(Default)]
    struct StubPublisher {
        offline: AtomicBool,
        fail_after: Mutex<Option<usize>>,
        calls: AtomicUsize,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ConfirmationPublisher for StubPublisher {
        async fn publish_confirmation(&self, payload: Vec<u8>) -> bool {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.lock().unwrap().is_some_and(|limit| call >= limit) {
                return false;
            }
            self.sent.lock().unwrap().push(payload);
            true
        }

        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    async fn store_with(payloads: &[&str]) -> OutboundRetryStore<MemoryConfirmationLog> {
        let store = OutboundRetryStore::new(Arc::new(MemoryConfirmationLog::new()));
        for payload in payloads {
            store.enqueue(payload.as_bytes().to_vec()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn replays_in_enqueue_order() {
        let store = store_with(&["one", "two", "three"]).await;
        let publisher = StubPublisher::default();

        let report = store.replay_pending(&publisher).await.unwrap();
        assert_eq!(report.replayed, 3);
        assert_eq!(report.remaining, 0);
        assert!(!report.halted);

        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn failed_publish_halts_the_sweep() {
        let store = store_with(&["one", "two", "three"]).await;
        let publisher = StubPublisher {
            fail_after: Mutex::new(Some(1)),
            ..StubPublisher::default()
        };

        let report = store.replay_pending(&publisher).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert!(report.halted);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);

        *publisher.fail_after.lock().unwrap() = None;
        let report = store.replay_pending(&publisher).await.unwrap();
        assert_eq!(report.replayed, 2);
        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn disconnected_publisher_is_not_called() {
        let store = store_with(&["one"]).await;
        let publisher = StubPublisher::default();
        publisher.offline.store(true, Ordering::SeqCst);

        let report = store.replay_pending(&publisher).await.unwrap();
        assert!(report.halted);
        assert_eq!(report.remaining, 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn periodic_sweep_replays_while_the_link_stays_up() {
        let store = Arc::new(
            store_with(&[])
                .await
                .with_sweep_interval(Duration::from_millis(50)),
        );
        let publisher = Arc::new(StubPublisher::default());
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&store).run(
            Arc::clone(&publisher),
            bus,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.enqueue(b"late".to_vec()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while store.pending_count().await.unwrap() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(publisher.sent.lock().unwrap().clone(), vec![b"late".to_vec()]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn storage_failure_surfaces_as_error() {
        let log = Arc::new(MemoryConfirmationLog::new());
        let store = OutboundRetryStore::new(Arc::clone(&log));
        log.set_unavailable(true);

        assert!(matches!(
            store.enqueue(b"x".to_vec()).await,
            Err(SyncError::Storage(_))
        ));
    }
}

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use syncwire_broker::{DeliveryHandler, HandlerError};
use syncwire_core::event::{EventBus, EventPayload, EventSource, emit};
use syncwire_storage::ConfirmationLog;
use tracing::{debug, error, info, warn};

use crate::contact::{ConfirmationPayload, ContactSyncMessage};
use crate::error::WriteError;
use crate::publisher::ConfirmationPublisher;
use crate::retry_store::OutboundRetryStore;
use crate::writer::ContactWriter;

const DEFAULT_IDEMPOTENCY_WINDOW: NonZeroUsize = match NonZeroUsize::new(512) {
    Some(window) => window,
    None => unreachable!(),
};

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub device_id: String,
    pub sla_threshold: Duration,
    pub idempotency_window: usize,
}

impl ProcessorSettings {
    pub fn from_config(config: &syncwire_core::config::Config) -> Self {
        Self {
            device_id: config.device.device_id.clone(),
            sla_threshold: config.processing.sla_threshold(),
            idempotency_window: config.processing.idempotency_window,
        }
    }
}

/// Turns inbound contact changes into writes and confirmations.
///
/// Malformed payloads are acknowledged and dropped. A transient write
/// failure requeues the delivery; a permanent one is reported back with an
/// error confirmation. Confirmations that cannot be published right away go
/// to the retry store.
pub struct MessageProcessor<W, P, L> {
    writer: Arc<W>,
    publisher: Arc<P>,
    retry_store: Arc<OutboundRetryStore<L>>,
    settings: ProcessorSettings,
    applied: Mutex<LruCache<String, ConfirmationPayload>>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<W, P, L> MessageProcessor<W, P, L>
where
    W: ContactWriter,
    P: ConfirmationPublisher,
    L: ConfirmationLog,
{
    pub fn new(
        writer: Arc<W>,
        publisher: Arc<P>,
        retry_store: Arc<OutboundRetryStore<L>>,
        settings: ProcessorSettings,
    ) -> Self {
        let window = NonZeroUsize::new(settings.idempotency_window)
            .unwrap_or(DEFAULT_IDEMPOTENCY_WINDOW);
        Self {
            writer,
            publisher,
            retry_store,
            settings,
            applied: Mutex::new(LruCache::new(window)),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    async fn process(&self, contact: &ContactSyncMessage) -> Result<bool, HandlerError> {
        let key = contact.idempotency_key();
        if let Some(previous) = self.remembered(&key) {
            debug!(contact_id = %contact.id, "change already applied, re-sending confirmation");
            self.confirm(&previous).await?;
            return Ok(true);
        }

        let confirmation = match self.writer.apply(contact).await {
            Ok(local_contact_id) => {
                info!(
                    contact_id = %contact.id,
                    operation = contact.operation.as_str(),
                    "contact applied"
                );
                self.emit(
                    "sync.contact.applied",
                    EventPayload::ContactApplied {
                        contact_id: contact.id.clone(),
                        operation: contact.operation.as_str().to_string(),
                    },
                );
                ConfirmationPayload::success(contact, &self.settings.device_id, local_contact_id)
            }
            Err(WriteError::Transient(reason)) => {
                warn!(contact_id = %contact.id, %reason, "contact write failed, requeueing");
                return Err(HandlerError::new(reason));
            }
            Err(WriteError::Permanent(reason)) => {
                warn!(contact_id = %contact.id, %reason, "contact write rejected");
                ConfirmationPayload::failure(contact, &self.settings.device_id, reason)
            }
        };

        self.remember(key, confirmation.clone());
        self.confirm(&confirmation).await?;
        Ok(true)
    }

    /// Publish a confirmation, falling back to the retry store. Fails only
    /// when the confirmation could be neither published nor stored.
    async fn confirm(&self, confirmation: &ConfirmationPayload) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(confirmation)
            .map_err(|e| HandlerError::new(format!("failed to encode confirmation: {e}")))?;

        if self.publisher.is_connected()
            && self.publisher.publish_confirmation(payload.clone()).await
        {
            return Ok(());
        }

        match self.retry_store.enqueue(payload).await {
            Ok(stored) => {
                debug!(contact_id = %confirmation.contact_id, log_id = stored.id, "confirmation deferred");
                self.emit(
                    "sync.confirmation.queued",
                    EventPayload::ConfirmationQueued {
                        contact_id: confirmation.contact_id.clone(),
                        log_id: stored.id,
                    },
                );
                Ok(())
            }
            Err(error) => {
                error!(
                    contact_id = %confirmation.contact_id,
                    %error,
                    "could not publish or store confirmation"
                );
                Err(HandlerError::new(error.to_string()))
            }
        }
    }

    fn remembered(&self, key: &str) -> Option<ConfirmationPayload> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn remember(&self, key: String, confirmation: ConfirmationPayload) {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, confirmation);
    }

    fn check_sla(&self, contact_id: Option<&str>, elapsed: Duration) {
        let threshold = self.settings.sla_threshold;
        if elapsed <= threshold {
            return;
        }

        warn!(
            contact_id = contact_id.unwrap_or("<unparsed>"),
            elapsed_ms = elapsed.as_millis() as u64,
            threshold_ms = threshold.as_millis() as u64,
            "contact sync exceeded SLA"
        );
        self.emit(
            "sync.sla.violated",
            EventPayload::SlaViolated {
                contact_id: contact_id.map(str::to_owned),
                elapsed_ms: elapsed.as_millis() as u64,
                threshold_ms: threshold.as_millis() as u64,
            },
        );
    }

    fn emit(&self, channel: &str, payload: EventPayload) {
        if let Some(event_bus) = &self.event_bus {
            emit(event_bus.as_ref(), channel, EventSource::Sync, payload);
        }
    }
}

#[async_trait]
impl<W, P, L> DeliveryHandler for MessageProcessor<W, P, L>
where
    W: ContactWriter,
    P: ConfirmationPublisher,
    L: ConfirmationLog,
{
    async fn handle(&self, payload: &[u8]) -> Result<bool, HandlerError> {
        let started = Instant::now();

        let contact = match serde_json::from_slice::<ContactSyncMessage>(payload) {
            Ok(contact) => contact,
            Err(error) => {
                warn!(%error, bytes = payload.len(), "dropping malformed contact payload");
                self.check_sla(None, started.elapsed());
                return Ok(true);
            }
        };

        let outcome = self.process(&contact).await;
        self.check_sla(Some(&contact.id), started.elapsed());
        outcome
    }
}

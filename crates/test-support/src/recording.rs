use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use syncwire_sync::{
    ConfirmationPayload, ConfirmationPublisher, ContactSyncMessage, ContactWriter, WriteError,
};

/// Publisher that records every confirmation it accepts.
pub struct RecordingPublisher {
    connected: AtomicBool,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    published: Mutex<Vec<Vec<u8>>>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            failures_remaining: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn confirmations(&self) -> Vec<ConfirmationPayload> {
        self.published()
            .iter()
            .map(|payload| {
                serde_json::from_slice(payload).unwrap_or_else(|error| {
                    panic!("published payload is not a confirmation: {error}")
                })
            })
            .collect()
    }
}

impl ConfirmationPublisher for RecordingPublisher {
    async fn publish_confirmation(&self, payload: Vec<u8>) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return false;
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Contact writer that keeps applied changes in memory and can be scripted
/// to fail.
#[derive(Default)]
pub struct RecordingWriter {
    applied: Mutex<Vec<ContactSyncMessage>>,
    scripted_failures: Mutex<VecDeque<WriteError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    next_local_id: AtomicU64,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: WriteError) {
        self.scripted_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<ContactSyncMessage> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ContactWriter for RecordingWriter {
    async fn apply(&self, contact: &ContactSyncMessage) -> Result<Option<String>, WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripted_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(contact.clone());
        let local_id = self.next_local_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(local_id.to_string()))
    }
}

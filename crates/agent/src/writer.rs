use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use syncwire_sync::{ContactSyncMessage, ContactWriter, SyncOperation, WriteError};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JournalEntry<'a> {
    applied_at: DateTime<Utc>,
    contact: &'a ContactSyncMessage,
}

/// Appends every applied change to a JSON-lines journal.
///
/// Stands in for the device contact store when the agent runs outside a
/// phone. I/O failures are reported as transient so the broker redelivers.
pub struct JournalContactWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JournalContactWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *file = Some(opened);
        }

        let Some(handle) = file.as_mut() else {
            return Ok(());
        };
        let written = async {
            handle.write_all(line).await?;
            handle.flush().await
        }
        .await;
        if written.is_err() {
            // Reopen on the next write.
            *file = None;
        }
        written
    }
}

impl ContactWriter for JournalContactWriter {
    async fn apply(&self, contact: &ContactSyncMessage) -> Result<Option<String>, WriteError> {
        let entry = JournalEntry {
            applied_at: Utc::now(),
            contact,
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| WriteError::Permanent(format!("contact cannot be encoded: {e}")))?;
        line.push(b'\n');

        self.append(&line)
            .await
            .map_err(|e| WriteError::Transient(format!("journal write failed: {e}")))?;
        debug!(contact_id = %contact.id, path = %self.path.display(), "contact journaled");

        Ok(match contact.operation {
            SyncOperation::CreateOrUpdate => Some(contact.id.clone()),
            SyncOperation::Delete => None,
        })
    }
}

//! Wire payloads exchanged with the contact sync backend.

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    CreateOrUpdate,
    Delete,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateOrUpdate => "create_or_update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub number: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostalAddress {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// One contact change pushed by the backend. Delete messages usually carry
/// only `id`, `operation` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSyncMessage {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub phone_numbers: Vec<PhoneNumber>,
    #[serde(default)]
    pub emails: Vec<EmailAddress>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub addresses: Vec<PostalAddress>,
    pub operation: SyncOperation,
    /// Milliseconds since the Unix epoch, set by the producer.
    pub timestamp: i64,
}

impl ContactSyncMessage {
    /// Stable per-change key used to recognise broker redeliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.id, self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Error,
}

/// Result of applying one contact change, published to the confirmation
/// queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPayload {
    pub contact_id: String,
    pub status: ConfirmationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "android_contact_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub local_contact_id: Option<String>,
    pub device_id: String,
    pub timestamp: i64,
}

impl ConfirmationPayload {
    pub fn success(
        contact: &ContactSyncMessage,
        device_id: &str,
        local_contact_id: Option<String>,
    ) -> Self {
        let message = match contact.operation {
            SyncOperation::CreateOrUpdate => "contact synchronized",
            SyncOperation::Delete => "contact deleted",
        };
        Self {
            contact_id: contact.id.clone(),
            status: ConfirmationStatus::Success,
            message: message.to_string(),
            error: None,
            local_contact_id,
            device_id: device_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn failure(contact: &ContactSyncMessage, device_id: &str, error: String) -> Self {
        Self {
            contact_id: contact.id.clone(),
            status: ConfirmationStatus::Error,
            message: format!("failed to apply {}", contact.operation.as_str()),
            error: Some(error),
            local_contact_id: None,
            device_id: device_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

//! Contact sync processing on top of the broker connection.

pub mod contact;
pub mod error;
pub mod processor;
pub mod publisher;
pub mod retry_store;
pub mod writer;

pub use contact::{
    ConfirmationPayload, ConfirmationStatus, ContactSyncMessage, EmailAddress, PhoneNumber,
    PostalAddress, SyncOperation,
};
pub use error::{SyncError, WriteError};
pub use processor::{MessageProcessor, ProcessorSettings};
pub use publisher::ConfirmationPublisher;
pub use retry_store::{OutboundRetryStore, ReplayReport};
pub use writer::ContactWriter;

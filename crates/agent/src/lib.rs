//! The syncwire contact sync agent.
//!
//! [`SyncService`] ties one owner's broker consumer to the lifecycle guards,
//! the message processor and the confirmation retry store. The binary in
//! `main.rs` builds one from the configuration file and runs it until
//! interrupted.

pub mod service;
pub mod telemetry;
pub mod writer;

pub use service::{ServiceParts, ServiceSettings, ServiceStatistics, StartOutcome, SyncService};
pub use writer::JournalContactWriter;

pub mod config;
pub mod error;
pub mod event;
pub mod network;
pub mod types;

pub use error::{EventBusError, Result, SyncwireError};
pub use types::{ConnectionIdentity, LinkState};

//! Connection lifecycle bookkeeping for syncwire.
//!
//! [`ConnectionRegistry`] keeps at most one live consumer per queue name
//! across the whole process. [`ConnectionStateManager`] runs the per-key
//! setup and cleanup state machine on top of it.

pub mod registry;
pub mod state;

pub use registry::{ConnectionRegistry, DEFAULT_COOLDOWN, RegistryEntry};
pub use state::{ConnectionRecord, ConnectionState, ConnectionStateManager, StateStatistics};

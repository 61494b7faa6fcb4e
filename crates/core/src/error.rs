use thiserror::Error;

/// The universal error type for the syncwire agent.
#[derive(Error, Debug)]
pub enum SyncwireError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for syncwire operations.
pub type Result<T> = std::result::Result<T, SyncwireError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a broker transport or by the connection around it.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("read timed out: {0}")]
    ReadTimeout(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("resource declaration conflict: {0}")]
    ResourceConflict(String),

    #[error("channel already closed: {0}")]
    ChannelClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Error returned by a delivery handler. The delivery is nacked and requeued.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

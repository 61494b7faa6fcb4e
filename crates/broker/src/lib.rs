//! Resilient connection to the message broker.
//!
//! [`BrokerConnection`] keeps exactly one consumer alive on an inbound queue.
//! All protocol work for a session runs on a dedicated worker thread; callers,
//! the delivery pump and the handler tasks talk to it over channels. Failures
//! are mapped by [`classify`] to a recovery policy that drives backoff.

pub mod amqp;
pub mod classifier;
pub mod connection;
mod dispatch;
pub mod error;
pub mod handler;
pub mod stats;
pub mod transport;
mod worker;

pub use amqp::AmqpTransport;
pub use classifier::{
    ErrorCategory, ErrorClassification, FailureTracker, RetryDecision, backoff_cap,
    backoff_delay, classify, jittered_backoff,
};
pub use connection::{BrokerConnection, ConnectionSettings};
pub use error::{BrokerError, HandlerError};
pub use handler::{DeliveryHandler, FnHandler, handler_fn};
pub use stats::ConnectionStats;
pub use transport::{
    BrokerTransport, DeliveryEvent, DeliveryStream, RawDelivery, ShutdownSignal, Topology,
    TransportSettings,
};

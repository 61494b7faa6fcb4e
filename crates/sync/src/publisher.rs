use std::future::Future;

use syncwire_broker::{BrokerConnection, BrokerTransport};

/// Outbound side used for confirmations.
pub trait ConfirmationPublisher: Send + Sync + 'static {
    /// `true` only once the broker confirmed the message.
    fn publish_confirmation(&self, payload: Vec<u8>) -> impl Future<Output = bool> + Send;

    fn is_connected(&self) -> bool;
}

impl<T: BrokerTransport> ConfirmationPublisher for BrokerConnection<T> {
    async fn publish_confirmation(&self, payload: Vec<u8>) -> bool {
        self.publish(payload).await
    }

    fn is_connected(&self) -> bool {
        BrokerConnection::is_connected(self)
    }
}

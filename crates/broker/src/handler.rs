use std::future::Future;

use async_trait::async_trait;

use crate::error::HandlerError;

/// Receives the payload of each inbound delivery.
///
/// `Ok(true)` acknowledges the delivery. `Ok(false)`, an error, a panic, or
/// running past the handler timeout all nack it with requeue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> Result<bool, HandlerError>;
}

/// Adapter turning an async closure into a [`DeliveryHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: &[u8]) -> Result<bool, HandlerError> {
        (self.0)(payload.to_vec()).await
    }
}

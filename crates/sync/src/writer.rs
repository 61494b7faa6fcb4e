use std::future::Future;

use crate::contact::ContactSyncMessage;
use crate::error::WriteError;

/// Applies a contact change to the device's contact store.
pub trait ContactWriter: Send + Sync + 'static {
    /// Returns the device-local contact id when the store assigns one.
    fn apply(
        &self,
        contact: &ContactSyncMessage,
    ) -> impl Future<Output = Result<Option<String>, WriteError>> + Send;
}

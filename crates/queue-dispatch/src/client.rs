//! Transport contract between the engine and a queue service.

use crate::error::QueueError;
use crate::message::{
    InboundMessage, PreparedMessage, QueueName, ReceiptHandle, ReceiveRequest, SendBatchOutput,
};
use async_trait::async_trait;
use std::collections::HashMap;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// A queue resolved against a service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueRef {
    name: QueueName,
    url: String,
}

impl QueueRef {
    /// Resolve a queue URL as `{endpoint}/{account_number}/{name}`
    ///
    /// The endpoint is used verbatim; a trailing slash produces a double
    /// slash in the URL.
    pub fn resolve(endpoint: &str, account_number: &str, name: QueueName) -> Self {
        let url = format!("{}/{}/{}", endpoint, account_number, name);
        Self { name, url }
    }

    /// Queue name
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Full queue URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for QueueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Operations the engine needs from a queue service
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// from many tasks at once. Receipt handles passed to `delete` and
/// `change_visibility` are the ones returned by `receive` on the same
/// transport.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Receive up to `request.max_messages` messages, long-polling for at
    /// most `request.wait_time_seconds`
    async fn receive(
        &self,
        queue: &QueueRef,
        request: &ReceiveRequest,
    ) -> Result<Vec<InboundMessage>, QueueError>;

    /// Permanently remove a delivered message
    async fn delete(&self, queue: &QueueRef, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Reset the visibility timeout of a delivered message
    async fn change_visibility(
        &self,
        queue: &QueueRef,
        receipt: &ReceiptHandle,
        visibility_timeout_seconds: u32,
    ) -> Result<(), QueueError>;

    /// Send a batch of at most ten prepared messages
    ///
    /// Per-entry failures are reported in the output rather than as an
    /// error; `Err` means the request as a whole failed.
    async fn send(
        &self,
        queue: &QueueRef,
        messages: &[PreparedMessage],
    ) -> Result<SendBatchOutput, QueueError>;

    /// Delete every message in the queue
    async fn purge(&self, queue: &QueueRef) -> Result<(), QueueError>;

    /// Read queue attributes; `["All"]` requests every attribute
    async fn get_attributes(
        &self,
        queue: &QueueRef,
        names: &[String],
    ) -> Result<HashMap<String, String>, QueueError>;
}

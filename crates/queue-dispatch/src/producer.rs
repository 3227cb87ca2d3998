//! Sending to producer queues.
//!
//! A [`Producer`] validates outbound messages up front, so a bad entry never
//! causes a partial send, then submits them in chunks of at most
//! `batch_size` entries. Chunks of one call go out in order. Transient
//! failures, of the whole request or of individual entries, are retried
//! with exponential backoff.

use crate::client::{QueueRef, QueueTransport};
use crate::config::ProducerOptions;
use crate::error::{QueueError, SerializationError, ValidationError};
use crate::message::{
    FailedSend, OutboundMessage, PreparedMessage, SentMessage, MAX_BATCH_SIZE, MAX_DELAY_SECONDS,
    MAX_MESSAGE_SIZE,
};
use crate::retry::{RetryPolicy, RetryState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Attribute holding the approximate number of visible messages
pub const QUEUE_SIZE_ATTRIBUTE: &str = "ApproximateNumberOfMessages";

/// Sends messages to one queue
///
/// # Example
///
/// ```rust
/// use queue_dispatch::{InMemoryTransport, OutboundMessage, Producer, ProducerOptions, QueueName, QueueRef};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let name = QueueName::new("outbox".to_string()).unwrap();
/// let transport = InMemoryTransport::new();
/// transport.create_queue(&name);
///
/// let queue = QueueRef::resolve("memory://local", "000000000000", name);
/// let producer = Producer::new(Arc::new(transport), queue, ProducerOptions::default());
///
/// let sent = producer
///     .send([OutboundMessage::new("1", "hello"), OutboundMessage::new("2", "world")])
///     .await
///     .unwrap();
/// assert_eq!(sent.len(), 2);
/// assert_eq!(producer.queue_size().await.unwrap(), 2);
/// # });
/// ```
#[derive(Clone)]
pub struct Producer {
    transport: Arc<dyn QueueTransport>,
    queue: QueueRef,
    options: ProducerOptions,
    retry: RetryPolicy,
}

impl Producer {
    /// Create a producer; transient failures are retried `options.max_retries` times
    pub fn new(transport: Arc<dyn QueueTransport>, queue: QueueRef, options: ProducerOptions) -> Self {
        let retry = RetryPolicy::new(
            options.max_retries,
            Duration::from_millis(200),
            Duration::from_secs(10),
            2.0,
        );
        Self {
            transport,
            queue,
            options,
            retry,
        }
    }

    /// Replace the retry policy used for transient send failures
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Send messages, returning one [`SentMessage`] per input in input order
    ///
    /// Fails without any transport call if an entry is invalid. If some
    /// entries still fail after retries the error is
    /// [`QueueError::SendFailed`], which lists both the failed and the
    /// succeeded entries.
    #[instrument(skip_all, fields(queue = %self.queue.name()))]
    pub async fn send(
        &self,
        messages: impl IntoIterator<Item = OutboundMessage>,
    ) -> Result<Vec<SentMessage>, QueueError> {
        // Options built by hand bypass config validation; `chunks` needs a non-zero size.
        let batch_size = self.options.batch_size;
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "batch_size".to_string(),
                message: format!("must be 1-{}, got {}", MAX_BATCH_SIZE, batch_size),
            }
            .into());
        }

        let messages: Vec<OutboundMessage> = messages.into_iter().collect();
        let prepared = self.prepare(&messages)?;
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        let order: HashMap<String, usize> = prepared
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.id.clone(), idx))
            .collect();

        let mut succeeded = Vec::with_capacity(prepared.len());
        let mut failed = Vec::new();
        let mut chunks = prepared.chunks(batch_size as usize);

        while let Some(chunk) = chunks.next() {
            if let Err(error) = self.send_chunk(chunk.to_vec(), &mut succeeded, &mut failed).await {
                if succeeded.is_empty() && failed.is_empty() {
                    return Err(error);
                }
                // Entries after a request-level failure are reported, not sent.
                let unsent = chunk.iter().chain(chunks.flatten());
                failed.extend(unsent.map(|m| failed_entry(&m.id, &error)));
                break;
            }
        }

        succeeded.sort_by_key(|s| order.get(&s.id).copied().unwrap_or(usize::MAX));

        if failed.is_empty() {
            debug!(count = succeeded.len(), "Messages sent");
            Ok(succeeded)
        } else {
            failed.sort_by_key(|f| order.get(&f.id).copied().unwrap_or(usize::MAX));
            warn!(
                failed = failed.len(),
                succeeded = succeeded.len(),
                "Some messages could not be sent"
            );
            Err(QueueError::SendFailed { failed, succeeded })
        }
    }

    /// Send a single message
    pub async fn send_one(&self, message: OutboundMessage) -> Result<SentMessage, QueueError> {
        let mut sent = self.send([message]).await?;
        sent.pop().ok_or_else(|| {
            QueueError::from(SerializationError::InvalidResponse {
                message: "send returned no result".to_string(),
            })
        })
    }

    /// Approximate number of visible messages in the queue
    pub async fn queue_size(&self) -> Result<u64, QueueError> {
        let attributes = self
            .transport
            .get_attributes(&self.queue, &[QUEUE_SIZE_ATTRIBUTE.to_string()])
            .await?;

        let value = attributes.get(QUEUE_SIZE_ATTRIBUTE).ok_or_else(|| {
            SerializationError::InvalidResponse {
                message: format!("{} missing from response", QUEUE_SIZE_ATTRIBUTE),
            }
        })?;

        value.parse().map_err(|_| {
            QueueError::from(SerializationError::InvalidAttribute {
                key: QUEUE_SIZE_ATTRIBUTE.to_string(),
            })
        })
    }

    /// Delete every message in the queue
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.transport.purge(&self.queue).await
    }

    /// Fetch queue attributes; an empty list requests all of them
    pub async fn attributes(&self, names: &[String]) -> Result<HashMap<String, String>, QueueError> {
        if names.is_empty() {
            self.transport
                .get_attributes(&self.queue, &["All".to_string()])
                .await
        } else {
            self.transport.get_attributes(&self.queue, names).await
        }
    }

    fn prepare(&self, messages: &[OutboundMessage]) -> Result<Vec<PreparedMessage>, QueueError> {
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(messages.len());

        for message in messages {
            if message.id.is_empty() {
                return Err(ValidationError::Required {
                    field: "id".to_string(),
                }
                .into());
            }
            if !seen.insert(message.id.as_str()) {
                return Err(ValidationError::InvalidFormat {
                    field: "id".to_string(),
                    message: format!("duplicate entry id '{}'", message.id),
                }
                .into());
            }
            if self.queue.name().is_fifo() && message.group_id.is_none() {
                return Err(ValidationError::Required {
                    field: format!("group_id of message '{}'", message.id),
                }
                .into());
            }
            if let Some(delay) = message.delay_seconds {
                if delay > MAX_DELAY_SECONDS {
                    return Err(ValidationError::OutOfRange {
                        field: "delay_seconds".to_string(),
                        message: format!("{} exceeds {}", delay, MAX_DELAY_SECONDS),
                    }
                    .into());
                }
            }

            let entry = message.prepare()?;
            let size = wire_size(&entry);
            if size > MAX_MESSAGE_SIZE {
                return Err(QueueError::MessageTooLarge {
                    size,
                    max_size: MAX_MESSAGE_SIZE,
                });
            }
            prepared.push(entry);
        }

        Ok(prepared)
    }

    /// Submit one chunk, retrying transient failures
    ///
    /// Returns `Err` only for a request-level failure that is permanent or
    /// outlived its retries; entry-level results land in the two vectors.
    async fn send_chunk(
        &self,
        mut pending: Vec<PreparedMessage>,
        succeeded: &mut Vec<SentMessage>,
        failed: &mut Vec<FailedSend>,
    ) -> Result<(), QueueError> {
        let mut state = RetryState::new();

        loop {
            match self.transport.send(&self.queue, &pending).await {
                Ok(output) => {
                    succeeded.extend(output.successful);

                    let (permanent, transient): (Vec<_>, Vec<_>) =
                        output.failed.into_iter().partition(|f| f.sender_fault);
                    failed.extend(permanent);

                    if transient.is_empty() {
                        return Ok(());
                    }
                    if !state.can_retry(&self.retry) {
                        failed.extend(transient);
                        return Ok(());
                    }

                    let retry_ids: HashSet<&str> = transient.iter().map(|f| f.id.as_str()).collect();
                    pending.retain(|m| retry_ids.contains(m.id.as_str()));

                    let error = QueueError::SendFailed {
                        failed: transient,
                        succeeded: Vec::new(),
                    };
                    let delay = state.on_failure(&self.retry, &error);
                    debug!(
                        entries = pending.len(),
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying failed entries"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) if error.is_transient() && state.can_retry(&self.retry) => {
                    let delay = state.on_failure(&self.retry, &error);
                    warn!(
                        error = %error,
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Send failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Size as counted against the service limit: body plus attribute names and values
fn wire_size(message: &PreparedMessage) -> usize {
    message.body.len()
        + message
            .message_attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
}

fn failed_entry(id: &str, error: &QueueError) -> FailedSend {
    FailedSend {
        id: id.to_string(),
        code: "RequestFailed".to_string(),
        message: error.to_string(),
        sender_fault: !error.is_transient(),
    }
}

//! In-memory queue transport for testing and development.
//!
//! Behaves like an SQS queue closely enough to drive the engine end to end:
//! - visibility timeouts with per-delivery receipt handles
//! - receive counts and delivery delays
//! - long polling that wakes as soon as a message becomes available
//! - FIFO message groups that block while a group member is in flight
//! - purge and approximate attribute counts
//!
//! It also records call counts and can be told to fail upcoming calls, which
//! is how the engine's error paths are tested. Time is measured with
//! `tokio::time::Instant`, so paused-clock tests advance it deterministically.

use crate::client::{QueueRef, QueueTransport};
use crate::error::{QueueError, ValidationError};
use crate::message::{
    FailedSend, InboundMessage, MessageId, PreparedMessage, QueueName, ReceiptHandle,
    ReceiveRequest, SendBatchOutput, SentMessage, Timestamp, MAX_BATCH_SIZE,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Visibility timeout used when neither the queue nor the request sets one
pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u32 = 30;

const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct StoredMessage {
    message_id: MessageId,
    body: String,
    message_attributes: HashMap<String, String>,
    group_id: Option<String>,
    sent_at: Timestamp,
    first_received_at: Option<Timestamp>,
    available_at: Instant,
    receive_count: u32,
    /// Receipt of the most recent delivery
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.available_at <= now
    }

    fn is_in_flight(&self, now: Instant) -> bool {
        self.receipt.is_some() && !self.is_visible(now)
    }
}

struct InMemoryQueue {
    name: QueueName,
    visibility_timeout_seconds: u32,
    messages: Vec<StoredMessage>,
    created_at: Timestamp,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    fn find_by_receipt(&mut self, receipt: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt))
    }

    fn next_available_at(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .map(|m| m.available_at)
            .filter(|at| *at > now)
            .min()
    }
}

#[derive(Default)]
struct CallCounters {
    receive: AtomicUsize,
    delete: AtomicUsize,
    change_visibility: AtomicUsize,
    send: AtomicUsize,
    purge: AtomicUsize,
    get_attributes: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    receive: AtomicU32,
    delete: AtomicU32,
    change_visibility: AtomicU32,
    send: AtomicU32,
}

impl Faults {
    /// Consume one pending failure, returning whether the call should fail
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Snapshot of how often each transport operation was called
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCalls {
    pub receive: usize,
    pub delete: usize,
    pub change_visibility: usize,
    pub send: usize,
    pub purge: usize,
    pub get_attributes: usize,
}

impl TransportCalls {
    /// Total number of calls across all operations
    pub fn total(&self) -> usize {
        self.receive
            + self.delete
            + self.change_visibility
            + self.send
            + self.purge
            + self.get_attributes
    }
}

/// Approximate message counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Messages that can be received now
    pub visible: usize,
    /// Messages delivered and not yet deleted or returned
    pub in_flight: usize,
    /// Messages waiting out their delivery delay
    pub delayed: usize,
}

impl QueueCounts {
    /// All messages held by the queue
    pub fn total(&self) -> usize {
        self.visible + self.in_flight + self.delayed
    }
}

// ============================================================================
// In-Memory Transport
// ============================================================================

/// Thread-safe in-memory queue service
///
/// Clones share the same queues.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    queues: Arc<Mutex<HashMap<String, InMemoryQueue>>>,
    calls: Arc<CallCounters>,
    faults: Arc<Faults>,
}

impl InMemoryTransport {
    /// Create a transport with no queues
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InMemoryQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a queue with the default visibility timeout
    ///
    /// Creating an existing queue is a no-op.
    pub fn create_queue(&self, name: &QueueName) {
        self.create_queue_with_visibility(name, DEFAULT_VISIBILITY_TIMEOUT_SECONDS);
    }

    /// Create a queue with a specific default visibility timeout
    pub fn create_queue_with_visibility(&self, name: &QueueName, visibility_timeout_seconds: u32) {
        self.lock()
            .entry(name.as_str().to_string())
            .or_insert_with(|| InMemoryQueue {
                name: name.clone(),
                visibility_timeout_seconds,
                messages: Vec::new(),
                created_at: Timestamp::now(),
                notify: Arc::new(Notify::new()),
            });
    }

    /// Approximate message counts, or `None` for an unknown queue
    pub fn counts(&self, name: &str) -> Option<QueueCounts> {
        let queues = self.lock();
        let queue = queues.get(name)?;
        let now = Instant::now();

        let mut counts = QueueCounts::default();
        for message in &queue.messages {
            if message.is_visible(now) {
                counts.visible += 1;
            } else if message.receipt.is_some() {
                counts.in_flight += 1;
            } else {
                counts.delayed += 1;
            }
        }
        Some(counts)
    }

    /// Bodies of every message still held by the queue, in send order
    pub fn bodies(&self, name: &str) -> Vec<String> {
        self.lock()
            .get(name)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of calls made so far per operation
    pub fn calls(&self) -> TransportCalls {
        let c = &self.calls;
        TransportCalls {
            receive: c.receive.load(Ordering::SeqCst),
            delete: c.delete.load(Ordering::SeqCst),
            change_visibility: c.change_visibility.load(Ordering::SeqCst),
            send: c.send.load(Ordering::SeqCst),
            purge: c.purge.load(Ordering::SeqCst),
            get_attributes: c.get_attributes.load(Ordering::SeqCst),
        }
    }

    /// Fail the next `count` receive calls with a connection error
    pub fn fail_next_receives(&self, count: u32) {
        self.faults.receive.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` delete calls with a connection error
    pub fn fail_next_deletes(&self, count: u32) {
        self.faults.delete.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` visibility changes with a connection error
    pub fn fail_next_visibility_changes(&self, count: u32) {
        self.faults.change_visibility.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` send calls with a connection error
    pub fn fail_next_sends(&self, count: u32) {
        self.faults.send.store(count, Ordering::SeqCst);
    }

    fn injected_failure(operation: &str) -> QueueError {
        QueueError::ConnectionFailed {
            message: format!("injected {} failure", operation),
        }
    }

    fn not_found(queue: &QueueRef) -> QueueError {
        QueueError::QueueNotFound {
            queue_name: queue.name().to_string(),
        }
    }

    /// Take up to `max` visible messages, making them invisible
    fn try_receive(
        &self,
        queue: &QueueRef,
        request: &ReceiveRequest,
        now: Instant,
    ) -> Result<(Vec<InboundMessage>, Option<Instant>), QueueError> {
        let mut queues = self.lock();
        let stored = queues
            .get_mut(queue.name().as_str())
            .ok_or_else(|| Self::not_found(queue))?;

        let visibility = request
            .visibility_timeout_seconds
            .unwrap_or(stored.visibility_timeout_seconds);
        let fifo = stored.name.is_fifo();

        // FIFO groups with a message in flight deliver nothing else.
        let blocked_groups: HashSet<String> = if fifo {
            stored
                .messages
                .iter()
                .filter(|m| m.is_in_flight(now))
                .filter_map(|m| m.group_id.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut received = Vec::new();
        for message in stored.messages.iter_mut() {
            if received.len() >= request.max_messages as usize {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }
            if let Some(group) = &message.group_id {
                if blocked_groups.contains(group) {
                    continue;
                }
            }

            let receipt = uuid::Uuid::new_v4().to_string();
            message.receipt = Some(receipt.clone());
            message.receive_count += 1;
            message.available_at = now + Duration::from_secs(visibility.into());
            let first_received_at = message
                .first_received_at
                .get_or_insert_with(Timestamp::now)
                .clone();

            received.push(InboundMessage {
                message_id: message.message_id.clone(),
                receipt_handle: ReceiptHandle::new(receipt),
                body: message.body.clone(),
                attributes: system_attributes(message, &first_received_at, &request.attribute_names),
                message_attributes: filter_message_attributes(
                    &message.message_attributes,
                    &request.message_attribute_names,
                ),
                received_at: Timestamp::now(),
            });
        }

        Ok((received, stored.next_available_at(now)))
    }

    fn notifier(&self, queue: &QueueRef) -> Result<Arc<Notify>, QueueError> {
        self.lock()
            .get(queue.name().as_str())
            .map(|q| q.notify.clone())
            .ok_or_else(|| Self::not_found(queue))
    }
}

fn system_attributes(
    message: &StoredMessage,
    first_received_at: &Timestamp,
    names: &[String],
) -> HashMap<String, String> {
    let mut all = HashMap::new();
    all.insert(
        "ApproximateReceiveCount".to_string(),
        message.receive_count.to_string(),
    );
    all.insert(
        "SentTimestamp".to_string(),
        message.sent_at.as_datetime().timestamp_millis().to_string(),
    );
    all.insert(
        "ApproximateFirstReceiveTimestamp".to_string(),
        first_received_at.as_datetime().timestamp_millis().to_string(),
    );
    if let Some(group) = &message.group_id {
        all.insert("MessageGroupId".to_string(), group.clone());
    }

    if names.iter().any(|n| n == "All") {
        return all;
    }
    all.into_iter()
        .filter(|(k, _)| names.iter().any(|n| n == k))
        .collect()
}

/// Apply the SQS message attribute filter: `All`, `.*`, `prefix.*` or exact names
fn filter_message_attributes(
    attributes: &HashMap<String, String>,
    names: &[String],
) -> HashMap<String, String> {
    attributes
        .iter()
        .filter(|(key, _)| {
            names.iter().any(|name| {
                if name == "All" || name == ".*" {
                    return true;
                }
                match name.strip_suffix(".*") {
                    Some(prefix) => key.starts_with(&format!("{}.", prefix)),
                    None => name == *key,
                }
            })
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn receive(
        &self,
        queue: &QueueRef,
        request: &ReceiveRequest,
    ) -> Result<Vec<InboundMessage>, QueueError> {
        self.calls.receive.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.receive) {
            return Err(Self::injected_failure("receive"));
        }
        if request.max_messages == 0 || request.max_messages > MAX_BATCH_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "max_messages".to_string(),
                message: format!("must be 1-{}", MAX_BATCH_SIZE),
            }
            .into());
        }

        let notify = self.notifier(queue)?;
        let deadline = Instant::now() + Duration::from_secs(request.wait_time_seconds.into());

        loop {
            // Register for wake-ups before looking, so a send between the
            // check and the wait is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (messages, next_available) = self.try_receive(queue, request, now)?;
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }

            let wake_at = next_available.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue: &QueueRef, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.delete) {
            return Err(Self::injected_failure("delete"));
        }

        let mut queues = self.lock();
        let stored = queues
            .get_mut(queue.name().as_str())
            .ok_or_else(|| Self::not_found(queue))?;
        let index = stored
            .find_by_receipt(receipt.handle())
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            })?;
        stored.messages.remove(index);
        // Deleting may unblock a FIFO group.
        stored.notify.notify_waiters();
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &QueueRef,
        receipt: &ReceiptHandle,
        visibility_timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        self.calls.change_visibility.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.change_visibility) {
            return Err(Self::injected_failure("change_visibility"));
        }
        if visibility_timeout_seconds > MAX_VISIBILITY_TIMEOUT_SECONDS {
            return Err(ValidationError::OutOfRange {
                field: "visibility_timeout_seconds".to_string(),
                message: format!("must be 0-{}", MAX_VISIBILITY_TIMEOUT_SECONDS),
            }
            .into());
        }

        let now = Instant::now();
        let mut queues = self.lock();
        let stored = queues
            .get_mut(queue.name().as_str())
            .ok_or_else(|| Self::not_found(queue))?;
        let index = stored
            .find_by_receipt(receipt.handle())
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            })?;

        let message = &mut stored.messages[index];
        if message.is_visible(now) {
            // The delivery already expired; the receipt no longer controls it.
            return Err(QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            });
        }
        message.available_at = now + Duration::from_secs(visibility_timeout_seconds.into());
        if visibility_timeout_seconds == 0 {
            stored.notify.notify_waiters();
        }
        Ok(())
    }

    async fn send(
        &self,
        queue: &QueueRef,
        messages: &[PreparedMessage],
    ) -> Result<SendBatchOutput, QueueError> {
        self.calls.send.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.send) {
            return Err(Self::injected_failure("send"));
        }
        if messages.len() > MAX_BATCH_SIZE as usize {
            return Err(QueueError::BatchTooLarge {
                size: messages.len(),
                max_size: MAX_BATCH_SIZE as usize,
            });
        }

        let now = Instant::now();
        let mut queues = self.lock();
        let stored = queues
            .get_mut(queue.name().as_str())
            .ok_or_else(|| Self::not_found(queue))?;
        let fifo = stored.name.is_fifo();

        let mut output = SendBatchOutput::default();
        for message in messages {
            if fifo && message.group_id.is_none() {
                output.failed.push(FailedSend {
                    id: message.id.clone(),
                    code: "MissingParameter".to_string(),
                    message: "MessageGroupId is required for FIFO queues".to_string(),
                    sender_fault: true,
                });
                continue;
            }

            let message_id = MessageId::new();
            stored.messages.push(StoredMessage {
                message_id: message_id.clone(),
                body: message.body.clone(),
                message_attributes: message.message_attributes.clone(),
                group_id: message.group_id.clone(),
                sent_at: Timestamp::now(),
                first_received_at: None,
                available_at: now + Duration::from_secs(message.delay_seconds.unwrap_or(0).into()),
                receive_count: 0,
                receipt: None,
            });
            output.successful.push(SentMessage {
                id: message.id.clone(),
                message_id,
            });
        }

        stored.notify.notify_waiters();
        Ok(output)
    }

    async fn purge(&self, queue: &QueueRef) -> Result<(), QueueError> {
        self.calls.purge.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.lock();
        let stored = queues
            .get_mut(queue.name().as_str())
            .ok_or_else(|| Self::not_found(queue))?;
        stored.messages.clear();
        Ok(())
    }

    async fn get_attributes(
        &self,
        queue: &QueueRef,
        names: &[String],
    ) -> Result<HashMap<String, String>, QueueError> {
        self.calls.get_attributes.fetch_add(1, Ordering::SeqCst);
        let counts = self
            .counts(queue.name().as_str())
            .ok_or_else(|| Self::not_found(queue))?;

        let mut all = HashMap::new();
        all.insert(
            "ApproximateNumberOfMessages".to_string(),
            counts.visible.to_string(),
        );
        all.insert(
            "ApproximateNumberOfMessagesNotVisible".to_string(),
            counts.in_flight.to_string(),
        );
        all.insert(
            "ApproximateNumberOfMessagesDelayed".to_string(),
            counts.delayed.to_string(),
        );
        {
            let queues = self.lock();
            if let Some(stored) = queues.get(queue.name().as_str()) {
                all.insert(
                    "VisibilityTimeout".to_string(),
                    stored.visibility_timeout_seconds.to_string(),
                );
                all.insert(
                    "CreatedTimestamp".to_string(),
                    stored.created_at.as_datetime().timestamp().to_string(),
                );
                if stored.name.is_fifo() {
                    all.insert("FifoQueue".to_string(), "true".to_string());
                }
            }
        }

        if names.iter().any(|n| n == "All") {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|(k, _)| names.iter().any(|n| n == k))
            .collect())
    }
}

//! Bookkeeping for dispatch units whose handler has not yet settled.

use crate::message::{InboundMessage, QueueName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(test)]
#[path = "in_flight_tests.rs"]
mod tests;

/// One dispatch unit: a single message, or a whole batch
#[derive(Debug)]
pub struct InFlightRecord {
    id: Uuid,
    queue: QueueName,
    messages: Vec<InboundMessage>,
    started_at: Instant,
    extension_deadline: Instant,
    settled: AtomicBool,
    cancellation: CancellationToken,
}

impl InFlightRecord {
    /// Create a record whose visibility may be extended for at most
    /// `max_extension` after now
    pub fn new(queue: QueueName, messages: Vec<InboundMessage>, max_extension: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            id: Uuid::new_v4(),
            queue,
            messages,
            started_at,
            extension_deadline: started_at + max_extension,
            settled: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn messages(&self) -> &[InboundMessage] {
        &self.messages
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn extension_deadline(&self) -> Instant {
        self.extension_deadline
    }

    /// Mark the handler outcome as final; returns false if already settled
    pub fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Ask the dispatcher to abandon this unit
    pub fn abort(&self) {
        self.cancellation.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Shared map of a queue's in-flight records
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    records: Arc<RwLock<HashMap<Uuid, Arc<InFlightRecord>>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Arc<InFlightRecord>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id(), record);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<InFlightRecord>> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records currently in flight
    pub fn snapshot(&self) -> Vec<Arc<InFlightRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Abort every unsettled record, returning how many were aborted
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for record in self.snapshot() {
            if !record.is_settled() {
                record.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

//! Common test utilities for queue-dispatch integration tests
//!
//! This module provides:
//! - An event recorder that listens to every event kind of a queue
//! - Builders for configurations and in-memory transports
//! - Polling helpers for virtual-time tests

use queue_dispatch::{
    ConsumerEvent, ConsumerOptions, EngineConfig, EventKind, HandlerRegistration,
    InMemoryTransport, QueueDescriptor, QueueName,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ACCOUNT: &str = "000000000000";

// ============================================================================
// Event Recorder
// ============================================================================

/// Collects every event emitted for the queues it is attached to
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ConsumerEvent>>>,
}

#[allow(dead_code)]
impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every event kind on a registration
    pub fn attach(&self, registration: &mut HandlerRegistration) {
        for kind in EventKind::ALL {
            let events = self.events.clone();
            registration.on(kind, move |event| {
                events.lock().unwrap().push(event.clone());
                Ok(())
            });
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    pub fn events(&self) -> Vec<ConsumerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Message bodies reported as processed
    pub fn processed_bodies(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ConsumerEvent::MessageProcessed { message, .. } => Some(message.body.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait in virtual time until `kind` has been seen `count` times
    pub async fn wait_for(&self, kind: EventKind, count: usize) {
        wait_until(|| self.count(kind) >= count).await;
    }
}

/// Poll a condition every 50ms of virtual time, panicking after ten minutes
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..12_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Builders
// ============================================================================

#[allow(dead_code)]
pub fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

/// In-memory transport with the named queues created
#[allow(dead_code)]
pub fn transport_with(queues: &[&str]) -> InMemoryTransport {
    let transport = InMemoryTransport::new();
    for queue in queues {
        transport.create_queue(&queue_name(queue));
    }
    transport
}

/// Engine configuration pointing at a local endpoint
#[allow(dead_code)]
pub fn engine_config(queues: Vec<QueueDescriptor>) -> EngineConfig {
    let mut config = EngineConfig::new("http://localhost:9324", ACCOUNT)
        .with_shutdown_timeout(Duration::from_secs(10));
    config.queues = queues;
    config
}

/// Consumer options tuned for virtual-time tests
#[allow(dead_code)]
pub fn fast_options() -> ConsumerOptions {
    ConsumerOptions {
        wait_time_seconds: 1,
        ..Default::default()
    }
}

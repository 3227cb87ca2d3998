//! Consumer lifecycle events and the per-queue emitter that delivers them.

use crate::error::{BoxError, HandlerError, QueueError};
use crate::message::{InboundMessage, QueueName};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace, warn};

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;

/// Error type returned by event listeners
pub type ListenerError = BoxError;

/// A registered event listener
pub type Listener = Arc<dyn Fn(&ConsumerEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Kinds of consumer events a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    MessageProcessed,
    ResponseProcessed,
    Empty,
    Error,
    ProcessingError,
    TimeoutError,
    Stopped,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::MessageReceived,
        EventKind::MessageProcessed,
        EventKind::ResponseProcessed,
        EventKind::Empty,
        EventKind::Error,
        EventKind::ProcessingError,
        EventKind::TimeoutError,
        EventKind::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::MessageProcessed => "message_processed",
            Self::ResponseProcessed => "response_processed",
            Self::Empty => "empty",
            Self::Error => "error",
            Self::ProcessingError => "processing_error",
            Self::TimeoutError => "timeout_error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event raised by a queue's poller or dispatcher
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// A message was handed to the dispatcher
    MessageReceived {
        queue: QueueName,
        message: InboundMessage,
    },

    /// A message was handled successfully and deleted
    MessageProcessed {
        queue: QueueName,
        message: InboundMessage,
    },

    /// Every dispatch unit from one receive call has settled
    ResponseProcessed {
        queue: QueueName,
        message_count: usize,
    },

    /// A receive call returned no messages
    Empty { queue: QueueName },

    /// A queue operation failed; `message` is set when the failure concerned
    /// one message (a failed delete)
    Error {
        queue: QueueName,
        error: Arc<QueueError>,
        message: Option<InboundMessage>,
    },

    /// The handler reported failure for these messages
    ProcessingError {
        queue: QueueName,
        error: Arc<HandlerError>,
        messages: Vec<InboundMessage>,
    },

    /// The handler exceeded its deadline for these messages
    TimeoutError {
        queue: QueueName,
        timeout: Duration,
        messages: Vec<InboundMessage>,
    },

    /// The queue's poller has exited
    Stopped { queue: QueueName },
}

impl ConsumerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::MessageProcessed { .. } => EventKind::MessageProcessed,
            Self::ResponseProcessed { .. } => EventKind::ResponseProcessed,
            Self::Empty { .. } => EventKind::Empty,
            Self::Error { .. } => EventKind::Error,
            Self::ProcessingError { .. } => EventKind::ProcessingError,
            Self::TimeoutError { .. } => EventKind::TimeoutError,
            Self::Stopped { .. } => EventKind::Stopped,
        }
    }

    pub fn queue(&self) -> &QueueName {
        match self {
            Self::MessageReceived { queue, .. }
            | Self::MessageProcessed { queue, .. }
            | Self::ResponseProcessed { queue, .. }
            | Self::Empty { queue }
            | Self::Error { queue, .. }
            | Self::ProcessingError { queue, .. }
            | Self::TimeoutError { queue, .. }
            | Self::Stopped { queue } => queue,
        }
    }
}

/// Ordered listener list for one queue
///
/// Listeners run synchronously on the emitting task, in registration order.
/// A listener that returns an error or panics is logged and skipped; the
/// remaining listeners still run and the engine carries on.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Vec<(EventKind, Listener)>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind
    pub fn on<F>(&mut self, kind: EventKind, listener: F) -> &mut Self
    where
        F: Fn(&ConsumerEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners.push((kind, Arc::new(listener)));
        self
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.iter().filter(|(k, _)| *k == kind).count()
    }

    /// Deliver an event to every listener registered for its kind
    pub fn emit(&self, event: &ConsumerEvent) {
        let kind = event.kind();
        trace!(queue = %event.queue(), event = %kind, "Emitting consumer event");

        for (_, listener) in self.listeners.iter().filter(|(k, _)| *k == kind) {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(queue = %event.queue(), event = %kind, error = %e, "Event listener returned an error");
                }
                Err(panic) => {
                    error!(
                        queue = %event.queue(),
                        event = %kind,
                        panic = %panic_message(panic.as_ref()),
                        "Event listener panicked"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

//! Message handlers and the registry that binds them to queues.
//!
//! Handlers are registered explicitly at startup, one per queue, together
//! with that queue's event listeners:
//!
//! ```rust
//! use queue_dispatch::{EventKind, Handler, HandlerRegistry, QueueName};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register(
//!         QueueName::new("orders".to_string())?,
//!         Handler::single(|message| async move {
//!             println!("{}", message.body);
//!             Ok(())
//!         }),
//!     )?
//!     .on(EventKind::ProcessingError, |event| {
//!         eprintln!("{:?}", event);
//!         Ok(())
//!     });
//! # Ok(())
//! # }
//! ```

use crate::error::{ConfigurationError, HandlerError};
use crate::events::{ConsumerEvent, EventEmitter, EventKind, ListenerError};
use crate::message::{InboundMessage, QueueName};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

/// Handles one message at a time
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

/// Handles every message of one receive call together
///
/// An `Err` fails the whole batch: none of its messages are deleted.
#[async_trait]
pub trait BatchMessageHandler: Send + Sync {
    async fn handle_batch(&self, messages: Vec<InboundMessage>) -> Result<(), HandlerError>;
}

/// A queue's handler in either single or batch shape
#[derive(Clone)]
pub enum Handler {
    Single(Arc<dyn MessageHandler>),
    Batch(Arc<dyn BatchMessageHandler>),
}

impl Handler {
    /// Single-message handler from an async closure
    pub fn single<F, Fut>(f: F) -> Self
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::Single(Arc::new(FnHandler(f)))
    }

    /// Batch handler from an async closure
    pub fn batch<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<InboundMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::Batch(Arc::new(FnBatchHandler(f)))
    }

    pub fn from_handler<H: MessageHandler + 'static>(handler: H) -> Self {
        Self::Single(Arc::new(handler))
    }

    pub fn from_batch_handler<H: BatchMessageHandler + 'static>(handler: H) -> Self {
        Self::Batch(Arc::new(handler))
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Handler::Single"),
            Self::Batch(_) => f.write_str("Handler::Batch"),
        }
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

struct FnBatchHandler<F>(F);

#[async_trait]
impl<F, Fut> BatchMessageHandler for FnBatchHandler<F>
where
    F: Fn(Vec<InboundMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_batch(&self, messages: Vec<InboundMessage>) -> Result<(), HandlerError> {
        (self.0)(messages).await
    }
}

/// A queue's handler plus its event listeners
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    queue: QueueName,
    handler: Handler,
    events: EventEmitter,
}

impl HandlerRegistration {
    /// Register an event listener for this queue
    pub fn on<F>(&mut self, kind: EventKind, listener: F) -> &mut Self
    where
        F: Fn(&ConsumerEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.on(kind, listener);
        self
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }
}

/// All handler registrations, keyed by queue name
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    registrations: HashMap<QueueName, HandlerRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a queue; each queue accepts exactly one handler
    pub fn register(
        &mut self,
        queue: QueueName,
        handler: Handler,
    ) -> Result<&mut HandlerRegistration, ConfigurationError> {
        use std::collections::hash_map::Entry;

        match self.registrations.entry(queue) {
            Entry::Occupied(entry) => Err(ConfigurationError::DuplicateHandler {
                queue: entry.key().to_string(),
            }),
            Entry::Vacant(entry) => {
                let queue = entry.key().clone();
                Ok(entry.insert(HandlerRegistration {
                    queue,
                    handler,
                    events: EventEmitter::new(),
                }))
            }
        }
    }

    pub fn get(&self, queue: &str) -> Option<&HandlerRegistration> {
        self.registrations.get(queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueName> {
        self.registrations.keys()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub(crate) fn into_registrations(self) -> HashMap<QueueName, HandlerRegistration> {
        self.registrations
    }
}

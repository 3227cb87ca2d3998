//! # Queue Dispatch
//!
//! Consumer and producer engine for SQS and SQS-compatible queues.
//!
//! This library provides:
//! - Long-poll consumers with a per-queue concurrency bound
//! - Handler dispatch in single-message or batch shape, with timeouts
//! - Visibility extension while handlers run
//! - Typed lifecycle events with per-queue listeners
//! - Validated, chunked, retried producers
//! - An SQS HTTP transport and an in-memory transport
//!
//! ## Module Organization
//!
//! - [`engine`] - Wiring and `start`/`stop` lifecycle
//! - [`registry`] - Handler traits and the per-queue registry
//! - [`poller`], [`dispatcher`], [`visibility`] - The consume path
//! - [`producer`] - The send path
//! - [`client`] and [`providers`] - Transport contract and implementations
//! - [`config`], [`error`], [`events`], [`message`], [`retry`] - Shared types

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod in_flight;
pub mod message;
pub mod poller;
pub mod producer;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod visibility;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueRef, QueueTransport};
pub use config::{
    BackoffConfig, ConsumerOptions, Credentials, EngineConfig, ProducerOptions, QueueDescriptor,
    QueueMode,
};
pub use engine::Engine;
pub use error::{
    ConfigurationError, HandlerError, ProcessingFailure, QueueError, SerializationError,
    ValidationError,
};
pub use events::{ConsumerEvent, EventEmitter, EventKind, ListenerError};
pub use message::{
    InboundMessage, MessageBody, MessageId, OutboundMessage, QueueName, ReceiptHandle,
    SentMessage, Timestamp,
};
pub use producer::Producer;
pub use providers::{InMemoryTransport, SqsTransport};
pub use registry::{BatchMessageHandler, Handler, HandlerRegistration, HandlerRegistry, MessageHandler};
pub use retry::RetryPolicy;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

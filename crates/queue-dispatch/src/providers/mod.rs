//! Queue transport implementations.
//!
//! `SqsTransport` talks to SQS (or an SQS-compatible emulator) over HTTP;
//! `InMemoryTransport` keeps everything in process for tests and local runs.

pub mod memory;
pub mod sqs;

pub use memory::{InMemoryTransport, QueueCounts, TransportCalls};
pub use sqs::SqsTransport;

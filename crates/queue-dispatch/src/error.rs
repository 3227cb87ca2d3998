//! Error types for queue operations, handler failures and configuration.

use crate::message::{FailedSend, SentMessage};
use std::time::Duration;
use thiserror::Error;

/// Boxed error type used at handler and listener boundaries
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or receipt expired: {receipt}")]
    MessageNotFound { receipt: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Batch size {size} exceeds maximum {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("{} of {} messages failed to send", .failed.len(), .failed.len() + .succeeded.len())]
    SendFailed {
        failed: Vec<FailedSend>,
        succeeded: Vec<SentMessage>,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::PermissionDenied { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::BatchTooLarge { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::SendFailed { failed, .. } => failed.iter().all(|f| !f.sender_fault),
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            // Credentials rarely fix themselves quickly
            Self::AuthenticationFailed { .. } => Some(Duration::from_secs(10)),
            _ => None,
        }
    }

    /// Whether this error originates from engine or queue configuration
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::ConfigurationError(_))
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message attribute '{key}' has invalid value")]
    InvalidAttribute { key: String },

    #[error("Response could not be parsed: {message}")]
    InvalidResponse { message: String },
}

/// Configuration errors
///
/// These are never retried: they surface at engine construction or at the
/// call site of a producer/administrative operation.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Queue '{queue}' is registered more than once")]
    DuplicateQueue { queue: String },

    #[error("A handler is already registered for queue '{queue}'")]
    DuplicateHandler { queue: String },

    #[error("Consumer queue '{queue}' has no registered handler")]
    MissingHandler { queue: String },

    #[error("Handler registered for queue '{queue}' which is not configured as a consumer")]
    HandlerWithoutConsumer { queue: String },

    #[error("Queue '{queue}' expects a {expected} handler")]
    HandlerModeMismatch { queue: String, expected: String },

    #[error("Queue '{queue}' is not registered")]
    UnknownQueue { queue: String },

    #[error("Producer does not exist: {queue}")]
    ProducerNotFound { queue: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Failure reported by an application message handler.
///
/// Construct from a message, from any `std::error::Error`, or from an
/// `anyhow::Error` via `?`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl HandlerError {
    /// Create a handler error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the source
    pub fn from_source<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// Error message as reported by the handler
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Downcast the wrapped source error, if any
    pub fn source_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_ref().and_then(|s| s.downcast_ref::<E>())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        let message = format!("{:#}", error);
        Self {
            message,
            source: Some(error.into()),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Why a dispatched unit did not complete successfully
#[derive(Debug, Error)]
pub enum ProcessingFailure {
    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Handler timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

//! Message types for queue operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::str::FromStr;

/// Maximum encoded body size accepted by SQS
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum number of entries in a single receive or send batch
pub const MAX_BATCH_SIZE: u32 = 10;

/// Maximum per-message delivery delay accepted by SQS
pub const MAX_DELAY_SECONDS: u32 = 900;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated SQS queue name
///
/// SQS names are 1-80 characters of ASCII alphanumerics, hyphens and
/// underscores. FIFO queues carry a `.fifo` suffix that counts towards the
/// length limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Suffix that marks a FIFO queue
    pub const FIFO_SUFFIX: &'static str = ".fifo";

    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 80 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-80 characters".to_string(),
            });
        }

        let base = name.strip_suffix(Self::FIFO_SUFFIX).unwrap_or(&name);
        if base.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "name before the .fifo suffix cannot be empty".to_string(),
            });
        }

        if !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the queue is a FIFO queue
    pub fn is_fifo(&self) -> bool {
        self.0.ends_with(Self::FIFO_SUFFIX)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl Borrow<str> for QueueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Unique identifier assigned to a message by the queue service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// Opaque token for deleting or extending one specific delivery
///
/// Each receive produces a fresh handle; a handle must not be reused after
/// the message has been deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(handle: String) -> Self {
        Self(handle)
    }

    /// Get handle string
    pub fn handle(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message received from the queue, owned by the dispatcher for the
/// duration of one handler invocation
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    /// System attributes (`SentTimestamp`, `ApproximateReceiveCount`, ...)
    pub attributes: HashMap<String, String>,
    /// Application message attributes, string-valued
    pub message_attributes: HashMap<String, String>,
    pub received_at: Timestamp,
}

impl InboundMessage {
    /// Number of times the queue has delivered this message
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .get("ApproximateReceiveCount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// FIFO message group, if the queue reported one
    pub fn group_id(&self) -> Option<&str> {
        self.attributes.get("MessageGroupId").map(String::as_str)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Payload of an outbound message
///
/// Text bodies are sent verbatim; JSON bodies are serialized with
/// `serde_json::to_string`, which is the canonical string form consumers
/// decode with [`InboundMessage::json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Json(serde_json::Value),
}

impl MessageBody {
    /// Encode the body as it will be transmitted
    pub fn to_wire(&self) -> Result<String, SerializationError> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Json(value) => Ok(serde_json::to_string(value)?),
        }
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<serde_json::Value> for MessageBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// A message to be sent through a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Caller-chosen identifier, unique within one send call
    pub id: String,
    pub body: MessageBody,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub delay_seconds: Option<u32>,
    #[serde(default)]
    pub message_attributes: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create new message with body
    pub fn new(id: impl Into<String>, body: impl Into<MessageBody>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            group_id: None,
            deduplication_id: None,
            delay_seconds: None,
            message_attributes: HashMap::new(),
        }
    }

    /// Create a message whose body is any serializable value
    pub fn json<T: Serialize>(id: impl Into<String>, body: &T) -> Result<Self, SerializationError> {
        let value = serde_json::to_value(body)?;
        Ok(Self::new(id, MessageBody::Json(value)))
    }

    /// Set the FIFO message group
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the FIFO deduplication id
    pub fn with_deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }

    /// Delay delivery by the given number of seconds
    pub fn with_delay_seconds(mut self, delay_seconds: u32) -> Self {
        self.delay_seconds = Some(delay_seconds);
        self
    }

    /// Add a string message attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message_attributes.insert(key.into(), value.into());
        self
    }

    /// Serialize the body into its wire form
    pub fn prepare(&self) -> Result<PreparedMessage, SerializationError> {
        Ok(PreparedMessage {
            id: self.id.clone(),
            body: self.body.to_wire()?,
            group_id: self.group_id.clone(),
            deduplication_id: self.deduplication_id.clone(),
            delay_seconds: self.delay_seconds,
            message_attributes: self.message_attributes.clone(),
        })
    }
}

/// An outbound message with its body already in wire form
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMessage {
    pub id: String,
    pub body: String,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub delay_seconds: Option<u32>,
    pub message_attributes: HashMap<String, String>,
}

/// Successful send of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    /// Caller-chosen entry id
    pub id: String,
    /// Id assigned by the queue service
    pub message_id: MessageId,
}

/// Failed send of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSend {
    pub id: String,
    pub code: String,
    pub message: String,
    /// True when the request itself was at fault and retrying will not help
    pub sender_fault: bool,
}

/// Per-entry results of a send call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendBatchOutput {
    pub successful: Vec<SentMessage>,
    pub failed: Vec<FailedSend>,
}

// ============================================================================
// Receive Options
// ============================================================================

/// Parameters of a single receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Long-poll wait in seconds (0-20)
    pub wait_time_seconds: u32,
    /// Maximum number of messages to return (1-10)
    pub max_messages: u32,
    /// Visibility timeout applied to the returned messages
    pub visibility_timeout_seconds: Option<u32>,
    /// System attributes to include
    pub attribute_names: Vec<String>,
    /// Message attributes to include
    pub message_attribute_names: Vec<String>,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            wait_time_seconds: 0,
            max_messages: 1,
            visibility_timeout_seconds: None,
            attribute_names: Vec::new(),
            message_attribute_names: Vec::new(),
        }
    }
}

impl ReceiveRequest {
    /// Create new receive request with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of messages to receive
    pub fn with_max_messages(mut self, max: u32) -> Self {
        self.max_messages = max;
        self
    }

    /// Set long-poll wait time
    pub fn with_wait_time_seconds(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    /// Set visibility timeout for received messages
    pub fn with_visibility_timeout_seconds(mut self, seconds: u32) -> Self {
        self.visibility_timeout_seconds = Some(seconds);
        self
    }

    /// Add a message attribute name to the inclusion filter
    pub fn with_message_attribute_name(mut self, name: impl Into<String>) -> Self {
        self.message_attribute_names.push(name.into());
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

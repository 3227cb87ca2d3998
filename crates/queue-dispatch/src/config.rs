//! Engine and queue configuration.
//!
//! Configuration is plain serde data. It can be built in code or loaded from
//! a YAML/TOML/JSON file layered with `QD__`-prefixed environment variables
//! (`QD__ACCOUNT_NUMBER`, `QD__CREDENTIALS__ACCESS_KEY_ID`, ...).

use crate::client::QueueRef;
use crate::error::ConfigurationError;
use crate::message::{QueueName, ReceiveRequest, MAX_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "QD";

const MAX_WAIT_TIME_SECONDS: u32 = 20;
const MAX_VISIBILITY_SECONDS: u32 = 43_200;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service endpoint; defaults to the regional AWS endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Account number used to build queue URLs
    pub account_number: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Static credentials; requests are unsigned when absent
    #[serde(default)]
    pub credentials: Option<Credentials>,

    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Bound on how long `stop()` waits for in-flight handlers
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    #[serde(default)]
    pub queues: Vec<QueueDescriptor>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

impl EngineConfig {
    /// Create a configuration with defaults and no queues
    pub fn new(endpoint: impl Into<String>, account_number: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            account_number: account_number.into(),
            region: default_region(),
            credentials: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            queues: Vec::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_seconds = timeout.as_secs();
        self
    }

    pub fn with_queue(mut self, queue: QueueDescriptor) -> Self {
        self.queues.push(queue);
        self
    }

    /// Load configuration from an optional file plus environment overrides
    ///
    /// The file format is taken from the extension. Values from `QD__*`
    /// environment variables override file values. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigurationError::Missing {
                    key: path.display().to_string(),
                });
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        // Values stay strings so account numbers keep their leading zeros.
        let config: EngineConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Endpoint queue URLs are built from
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://sqs.{}.amazonaws.com", self.region),
        }
    }

    /// Look up a queue descriptor by name
    pub fn queue(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.iter().find(|q| q.name.as_str() == name)
    }

    /// Resolve a queue name to its URL
    pub fn queue_ref(&self, name: &QueueName) -> QueueRef {
        QueueRef::resolve(&self.endpoint(), &self.account_number, name.clone())
    }

    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(credentials) = copy.credentials.as_mut() {
            credentials.secret_access_key = "********".to_string();
            if credentials.session_token.is_some() {
                credentials.session_token = Some("********".to_string());
            }
        }
        copy
    }

    /// Check structural constraints and per-queue option ranges
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.account_number.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "account_number".to_string(),
            });
        }

        let endpoint = self.endpoint();
        url::Url::parse(&endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("endpoint '{}' is not a valid URL: {}", endpoint, e),
        })?;

        if self.request_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "request_timeout_seconds must be greater than 0".to_string(),
            });
        }

        if let Some(credentials) = &self.credentials {
            if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "credentials.access_key_id / credentials.secret_access_key".to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigurationError::DuplicateQueue {
                    queue: queue.name.to_string(),
                });
            }
            queue.validate()?;
        }

        Ok(())
    }
}

/// Static AWS credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<REDACTED>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// How the engine uses a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Poll and dispatch to a handler
    Consumer,
    /// Send only
    Producer,
    /// Both
    #[default]
    All,
}

impl QueueMode {
    pub fn consumes(&self) -> bool {
        matches!(self, Self::Consumer | Self::All)
    }

    pub fn produces(&self) -> bool {
        matches!(self, Self::Producer | Self::All)
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer => write!(f, "consumer"),
            Self::Producer => write!(f, "producer"),
            Self::All => write!(f, "all"),
        }
    }
}

/// One configured queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: QueueName,

    #[serde(default)]
    pub mode: QueueMode,

    #[serde(default)]
    pub consumer: ConsumerOptions,

    #[serde(default)]
    pub producer: ProducerOptions,
}

impl QueueDescriptor {
    /// Queue used for both consuming and producing
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            mode: QueueMode::All,
            consumer: ConsumerOptions::default(),
            producer: ProducerOptions::default(),
        }
    }

    pub fn consumer(name: QueueName) -> Self {
        Self::new(name).with_mode(QueueMode::Consumer)
    }

    pub fn producer(name: QueueName) -> Self {
        Self::new(name).with_mode(QueueMode::Producer)
    }

    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer = options;
        self
    }

    pub fn with_producer_options(mut self, options: ProducerOptions) -> Self {
        self.producer = options;
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.mode.consumes() {
            self.consumer.validate(&self.name)?;
        }
        if self.mode.produces() {
            self.producer.validate(&self.name)?;
        }
        Ok(())
    }
}

/// Polling and dispatch settings for a consumer queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Long-poll wait per receive (0-20)
    pub wait_time_seconds: u32,

    /// Maximum messages per receive (1-10)
    pub batch_size: u32,

    /// Visibility timeout requested on receive and used for extensions
    pub visibility_timeout_seconds: u32,

    /// Maximum dispatch units in flight at once
    pub concurrency_limit: usize,

    /// Make failed, timed-out and abandoned messages visible again
    /// immediately instead of waiting for their visibility timeout
    pub terminate_visibility_timeout: bool,

    /// System attributes to request
    pub attribute_names: Vec<String>,

    /// Message attributes to request
    pub message_attribute_names: Vec<String>,

    /// Expected handler shape; `Some(true)` requires a batch handler
    pub batch: Option<bool>,

    /// Per-invocation handler deadline
    pub handle_message_timeout_ms: Option<u64>,

    /// Visibility extension period; unset disables extension
    pub heartbeat_interval_seconds: Option<u32>,

    /// Stop extending once a unit has been in flight this long
    pub max_visibility_extension_seconds: u32,

    /// Pause after each successful receive
    pub polling_wait_time_ms: u64,

    /// Backoff after receive failures
    pub error_backoff: BackoffConfig,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            wait_time_seconds: 20,
            batch_size: 1,
            visibility_timeout_seconds: 30,
            concurrency_limit: 10,
            terminate_visibility_timeout: false,
            attribute_names: vec!["All".to_string()],
            message_attribute_names: vec!["All".to_string()],
            batch: None,
            handle_message_timeout_ms: None,
            heartbeat_interval_seconds: None,
            max_visibility_extension_seconds: MAX_VISIBILITY_SECONDS,
            polling_wait_time_ms: 0,
            error_backoff: BackoffConfig::default(),
        }
    }
}

impl ConsumerOptions {
    /// Receive parameters for one poll
    pub fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            wait_time_seconds: self.wait_time_seconds,
            max_messages: self.batch_size,
            visibility_timeout_seconds: Some(self.visibility_timeout_seconds),
            attribute_names: self.attribute_names.clone(),
            message_attribute_names: self.message_attribute_names.clone(),
        }
    }

    pub fn handle_message_timeout(&self) -> Option<Duration> {
        self.handle_message_timeout_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_seconds
            .map(|s| Duration::from_secs(s.into()))
    }

    fn validate(&self, queue: &QueueName) -> Result<(), ConfigurationError> {
        let invalid = |message: String| ConfigurationError::Invalid {
            message: format!("queue '{}': {}", queue, message),
        };

        if self.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(invalid(format!(
                "wait_time_seconds must be 0-{}",
                MAX_WAIT_TIME_SECONDS
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(format!("batch_size must be 1-{}", MAX_BATCH_SIZE)));
        }
        if self.visibility_timeout_seconds > MAX_VISIBILITY_SECONDS {
            return Err(invalid(format!(
                "visibility_timeout_seconds must be 0-{}",
                MAX_VISIBILITY_SECONDS
            )));
        }
        if self.concurrency_limit == 0 {
            return Err(invalid("concurrency_limit must be at least 1".to_string()));
        }
        if self.handle_message_timeout_ms == Some(0) {
            return Err(invalid(
                "handle_message_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(heartbeat) = self.heartbeat_interval_seconds {
            if heartbeat == 0 || heartbeat >= self.visibility_timeout_seconds {
                return Err(invalid(
                    "heartbeat_interval_seconds must be greater than 0 and less than visibility_timeout_seconds"
                        .to_string(),
                ));
            }
        }
        if self.max_visibility_extension_seconds > MAX_VISIBILITY_SECONDS {
            return Err(invalid(format!(
                "max_visibility_extension_seconds must be at most {}",
                MAX_VISIBILITY_SECONDS
            )));
        }
        self.error_backoff.validate().map_err(invalid)?;
        Ok(())
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("error_backoff.initial_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("error_backoff.max_delay_ms must be at least initial_delay_ms".to_string());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err("error_backoff.multiplier must be a finite value >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Settings for sending to a producer queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerOptions {
    /// Maximum entries per send request (1-10)
    pub batch_size: u32,

    /// Retries for transient send failures
    pub max_retries: u32,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            max_retries: 3,
        }
    }
}

impl ProducerOptions {
    fn validate(&self, queue: &QueueName) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "queue '{}': producer batch_size must be 1-{}",
                    queue, MAX_BATCH_SIZE
                ),
            });
        }
        Ok(())
    }
}

//! The engine: validated wiring of queues, handlers and transport, plus the
//! consumer lifecycle.
//!
//! ```rust,no_run
//! use queue_dispatch::{Engine, EngineConfig, Handler, HandlerRegistry, QueueDescriptor, QueueName};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orders = QueueName::new("orders".to_string())?;
//! let config = EngineConfig::new("http://localhost:9324", "000000000000")
//!     .with_queue(QueueDescriptor::new(orders.clone()));
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(orders, Handler::single(|message| async move {
//!     println!("{}", message.body);
//!     Ok(())
//! }))?;
//!
//! let engine = Engine::from_config(config, registry)?;
//! engine.start()?;
//! tokio::signal::ctrl_c().await?;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::client::{QueueRef, QueueTransport};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigurationError, QueueError};
use crate::message::{OutboundMessage, SentMessage};
use crate::poller::Poller;
use crate::producer::Producer;
use crate::providers::SqsTransport;
use crate::registry::HandlerRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Consumers and producers for every configured queue
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn QueueTransport>,
    queues: HashMap<String, QueueRef>,
    consumers: Vec<Dispatcher>,
    producers: HashMap<String, Producer>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    pollers: TaskTracker,
}

impl Engine {
    /// Validate the configuration against the registered handlers and wire
    /// up one dispatcher per consumer queue and one producer per producer queue
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn QueueTransport>,
        registry: HandlerRegistry,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let mut registrations = registry.into_registrations();
        for (name, registration) in &registrations {
            let descriptor = config
                .queue(name.as_str())
                .ok_or_else(|| ConfigurationError::UnknownQueue {
                    queue: name.to_string(),
                })?;

            if !descriptor.mode.consumes() {
                return Err(ConfigurationError::HandlerWithoutConsumer {
                    queue: name.to_string(),
                });
            }

            if let Some(batch) = descriptor.consumer.batch {
                if batch != registration.handler().is_batch() {
                    return Err(ConfigurationError::HandlerModeMismatch {
                        queue: name.to_string(),
                        expected: if batch { "batch" } else { "single" }.to_string(),
                    });
                }
            }
        }

        let mut queues = HashMap::new();
        let mut consumers = Vec::new();
        let mut producers = HashMap::new();

        for descriptor in &config.queues {
            let queue = config.queue_ref(&descriptor.name);
            queues.insert(descriptor.name.to_string(), queue.clone());

            if descriptor.mode.consumes() {
                let registration = registrations.remove(descriptor.name.as_str()).ok_or_else(|| {
                    ConfigurationError::MissingHandler {
                        queue: descriptor.name.to_string(),
                    }
                })?;
                consumers.push(Dispatcher::new(
                    transport.clone(),
                    queue.clone(),
                    descriptor.consumer.clone(),
                    registration.handler().clone(),
                    registration.events().clone(),
                ));
            }

            if descriptor.mode.produces() {
                producers.insert(
                    descriptor.name.to_string(),
                    Producer::new(transport.clone(), queue, descriptor.producer.clone()),
                );
            }
        }

        Ok(Self {
            config,
            transport,
            queues,
            consumers,
            producers,
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            pollers: TaskTracker::new(),
        })
    }

    /// Build an engine that talks to SQS over HTTP
    pub fn from_config(config: EngineConfig, registry: HandlerRegistry) -> Result<Self, QueueError> {
        let transport = Arc::new(SqsTransport::from_config(&config)?);
        Ok(Self::new(config, transport, registry)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Start one poller per consumer queue
    ///
    /// Calling `start` on a running engine does nothing. A stopped engine
    /// cannot be restarted.
    pub fn start(&self) -> Result<(), ConfigurationError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => {
                return Err(ConfigurationError::Invalid {
                    message: "engine has been stopped and cannot be restarted".to_string(),
                })
            }
            Lifecycle::Idle => {}
        }

        let grace = self.shutdown_timeout();
        for dispatcher in &self.consumers {
            let poller = Poller::new(dispatcher.clone(), self.shutdown.child_token(), grace);
            self.pollers.spawn(poller.run());
        }
        *lifecycle = Lifecycle::Running;

        info!(consumers = self.consumers.len(), "Engine started");
        Ok(())
    }

    /// Whether pollers are running
    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) == Lifecycle::Running
    }

    /// Signal every poller to stop and wait until they have drained
    ///
    /// Safe to call more than once and from several tasks; every caller
    /// returns once all pollers have finished.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        if previous == Lifecycle::Running {
            info!("Engine stopping");
        }

        self.shutdown.cancel();
        self.pollers.close();
        self.pollers.wait().await;

        if previous == Lifecycle::Running {
            info!("Engine stopped");
        }
    }

    /// Producer for a queue configured in `producer` or `all` mode
    pub fn producer(&self, queue: &str) -> Result<&Producer, ConfigurationError> {
        self.producers
            .get(queue)
            .ok_or_else(|| ConfigurationError::ProducerNotFound {
                queue: queue.to_string(),
            })
    }

    /// Send messages through a queue's producer
    pub async fn send(
        &self,
        queue: &str,
        messages: impl IntoIterator<Item = OutboundMessage>,
    ) -> Result<Vec<SentMessage>, QueueError> {
        self.producer(queue)?.send(messages).await
    }

    /// Approximate number of visible messages in a producer queue
    pub async fn producer_queue_size(&self, queue: &str) -> Result<u64, QueueError> {
        self.producer(queue)?.queue_size().await
    }

    /// Delete every message in a configured queue
    pub async fn purge_queue(&self, queue: &str) -> Result<(), QueueError> {
        let queue = self.queue_ref(queue)?;
        info!(queue = %queue.name(), "Purging queue");
        self.transport.purge(queue).await
    }

    /// All attributes of a configured queue
    pub async fn get_queue_attributes(&self, queue: &str) -> Result<HashMap<String, String>, QueueError> {
        let queue = self.queue_ref(queue)?;
        self.transport
            .get_attributes(queue, &["All".to_string()])
            .await
    }

    /// URL of a configured queue
    pub fn queue_url(&self, queue: &str) -> Result<&str, ConfigurationError> {
        Ok(self.queue_ref(queue)?.url())
    }

    fn queue_ref(&self, queue: &str) -> Result<&QueueRef, ConfigurationError> {
        self.queues
            .get(queue)
            .ok_or_else(|| ConfigurationError::UnknownQueue {
                queue: queue.to_string(),
            })
    }

    fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_timeout_seconds)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

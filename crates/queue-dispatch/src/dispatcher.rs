//! Runs a handler for one dispatch unit and settles its messages.
//!
//! A dispatch unit is a single message in single mode or the messages of
//! one receive call in batch mode. The dispatcher owns the unit from the
//! moment the poller hands it over until every message has been deleted or
//! left for redelivery:
//!
//! 1. register an in-flight record and emit `MessageReceived` per message
//! 2. start the visibility extender when a heartbeat interval is configured
//! 3. run the handler in its own task, racing it against the optional
//!    timeout and the record's cancellation
//! 4. settle the record and stop the extender
//! 5. delete on success, or report the failure and leave the messages
//!
//! The concurrency permit passed in is held until the unit is settled.

use crate::client::{QueueRef, QueueTransport};
use crate::config::ConsumerOptions;
use crate::error::{HandlerError, ProcessingFailure};
use crate::events::{panic_message, ConsumerEvent, EventEmitter};
use crate::in_flight::{InFlightRecord, InFlightRegistry};
use crate::message::InboundMessage;
use crate::registry::Handler;
use crate::visibility::VisibilityExtender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

/// How a dispatch unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; messages were deleted (or a delete failure was reported)
    Succeeded,
    /// Handler returned an error or panicked
    Failed,
    /// Handler exceeded `handle_message_timeout_ms`
    TimedOut,
    /// The unit was aborted by shutdown
    Cancelled,
}

enum HandlerResult {
    Completed(Result<(), HandlerError>),
    TimedOut(Duration),
    Cancelled,
}

/// Per-queue dispatcher, cheap to clone into spawned tasks
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn QueueTransport>,
    queue: QueueRef,
    options: Arc<ConsumerOptions>,
    handler: Handler,
    events: Arc<EventEmitter>,
    in_flight: InFlightRegistry,
}

impl Dispatcher {
    /// Create a dispatcher for one consumer queue
    ///
    /// The dispatcher starts with an empty in-flight registry; clones share
    /// it, along with the options and event listeners.
    ///
    /// # Arguments
    ///
    /// * `transport` - Transport used for deletes and visibility changes
    /// * `queue` - The consumer queue the dispatched messages came from
    /// * `options` - Consumer options; timeout, heartbeat and termination settings apply per unit
    /// * `handler` - Single or batch handler; decides how receive results are split into units
    /// * `events` - Listeners notified of every lifecycle event for this queue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use queue_dispatch::dispatcher::Dispatcher;
    /// use queue_dispatch::{
    ///     ConsumerOptions, EventEmitter, Handler, InMemoryTransport, QueueName, QueueRef,
    /// };
    /// use std::sync::Arc;
    ///
    /// let name = QueueName::new("orders".to_string()).unwrap();
    /// let transport = InMemoryTransport::new();
    /// transport.create_queue(&name);
    ///
    /// let dispatcher = Dispatcher::new(
    ///     Arc::new(transport),
    ///     QueueRef::resolve("memory://local", "000000000000", name),
    ///     ConsumerOptions::default(),
    ///     Handler::single(|_message| async { Ok(()) }),
    ///     EventEmitter::new(),
    /// );
    ///
    /// assert!(dispatcher.units(Vec::new()).is_empty());
    /// assert_eq!(dispatcher.in_flight().len(), 0);
    /// ```
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        queue: QueueRef,
        options: ConsumerOptions,
        handler: Handler,
        events: EventEmitter,
    ) -> Self {
        Self {
            transport,
            queue,
            options: Arc::new(options),
            handler,
            events: Arc::new(events),
            in_flight: InFlightRegistry::new(),
        }
    }

    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    pub(crate) fn emit(&self, event: ConsumerEvent) {
        self.events.emit(&event);
    }

    /// Split one receive result into dispatch units
    pub fn units(&self, messages: Vec<InboundMessage>) -> Vec<Vec<InboundMessage>> {
        if messages.is_empty() {
            return Vec::new();
        }
        match self.handler {
            Handler::Single(_) => messages.into_iter().map(|m| vec![m]).collect(),
            Handler::Batch(_) => vec![messages],
        }
    }

    /// Process one unit to completion
    #[instrument(skip_all, fields(queue = %self.queue.name(), messages = messages.len()))]
    pub async fn dispatch(
        &self,
        messages: Vec<InboundMessage>,
        permit: OwnedSemaphorePermit,
    ) -> DispatchOutcome {
        let _permit = permit;

        let max_extension = Duration::from_secs(self.options.max_visibility_extension_seconds.into());
        let record = Arc::new(InFlightRecord::new(
            self.queue.name().clone(),
            messages,
            max_extension,
        ));
        self.in_flight.insert(record.clone());

        for message in record.messages() {
            self.emit(ConsumerEvent::MessageReceived {
                queue: self.queue.name().clone(),
                message: message.clone(),
            });
        }

        let extender = self.options.heartbeat_interval().map(|interval| {
            VisibilityExtender::spawn(
                self.transport.clone(),
                self.queue.clone(),
                record.clone(),
                interval,
                self.options.visibility_timeout_seconds,
            )
        });

        let result = self.run_handler(&record).await;

        record.settle();
        if let Some(extender) = extender {
            extender.stop().await;
        }

        let outcome = match result {
            HandlerResult::Completed(Ok(())) => {
                self.delete_all(record.messages()).await;
                DispatchOutcome::Succeeded
            }
            HandlerResult::Completed(Err(error)) => {
                self.on_failure(record.messages(), ProcessingFailure::Handler(error))
                    .await;
                DispatchOutcome::Failed
            }
            HandlerResult::TimedOut(timeout) => {
                self.on_failure(record.messages(), ProcessingFailure::Timeout { timeout })
                    .await;
                DispatchOutcome::TimedOut
            }
            HandlerResult::Cancelled => {
                debug!("Dispatch cancelled by shutdown");
                if self.options.terminate_visibility_timeout {
                    self.release(record.messages()).await;
                }
                DispatchOutcome::Cancelled
            }
        };

        self.in_flight.remove(record.id());
        outcome
    }

    async fn run_handler(&self, record: &InFlightRecord) -> HandlerResult {
        let mut task = self.spawn_handler(record.messages().to_vec());
        let timeout = self.options.handle_message_timeout();

        // A handler that has already finished wins over a deadline or stop
        // signal that became ready in the same poll.
        tokio::select! {
            biased;
            joined = &mut task => HandlerResult::Completed(joined.unwrap_or_else(|e| Err(join_failure(e)))),
            _ = sleep_or_pending(timeout) => {
                task.abort();
                HandlerResult::TimedOut(timeout.unwrap_or_default())
            }
            _ = record.cancellation().cancelled() => {
                task.abort();
                HandlerResult::Cancelled
            }
        }
    }

    /// Run the handler in its own task so a panic surfaces as a `JoinError`
    fn spawn_handler(&self, messages: Vec<InboundMessage>) -> JoinHandle<Result<(), HandlerError>> {
        match &self.handler {
            Handler::Single(handler) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    for message in messages {
                        handler.handle(message).await?;
                    }
                    Ok(())
                })
            }
            Handler::Batch(handler) => {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle_batch(messages).await })
            }
        }
    }

    async fn delete_all(&self, messages: &[InboundMessage]) {
        for message in messages {
            match self
                .transport
                .delete(&self.queue, &message.receipt_handle)
                .await
            {
                Ok(()) => {
                    debug!(message_id = %message.message_id, "Message processed and deleted");
                    self.emit(ConsumerEvent::MessageProcessed {
                        queue: self.queue.name().clone(),
                        message: message.clone(),
                    });
                }
                Err(error) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %error,
                        "Failed to delete processed message; it will be redelivered"
                    );
                    self.emit(ConsumerEvent::Error {
                        queue: self.queue.name().clone(),
                        error: Arc::new(error),
                        message: Some(message.clone()),
                    });
                }
            }
        }
    }

    async fn on_failure(&self, messages: &[InboundMessage], failure: ProcessingFailure) {
        warn!(error = %failure, "Message processing failed; leaving messages for redelivery");

        let event = match failure {
            ProcessingFailure::Handler(error) => ConsumerEvent::ProcessingError {
                queue: self.queue.name().clone(),
                error: Arc::new(error),
                messages: messages.to_vec(),
            },
            ProcessingFailure::Timeout { timeout } => ConsumerEvent::TimeoutError {
                queue: self.queue.name().clone(),
                timeout,
                messages: messages.to_vec(),
            },
        };
        self.emit(event);

        if self.options.terminate_visibility_timeout {
            self.release(messages).await;
        }
    }

    /// Make messages visible again immediately
    pub(crate) async fn release(&self, messages: &[InboundMessage]) {
        for message in messages {
            if let Err(error) = self
                .transport
                .change_visibility(&self.queue, &message.receipt_handle, 0)
                .await
            {
                warn!(
                    message_id = %message.message_id,
                    error = %error,
                    "Failed to reset message visibility"
                );
            }
        }
    }
}

fn join_failure(error: JoinError) -> HandlerError {
    if error.is_panic() {
        HandlerError::new(format!(
            "handler panicked: {}",
            panic_message(error.into_panic().as_ref())
        ))
    } else {
        HandlerError::new("handler task was cancelled")
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

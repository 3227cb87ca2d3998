//! Long-poll loop that feeds a queue's dispatcher.

use crate::dispatcher::Dispatcher;
use crate::error::QueueError;
use crate::events::ConsumerEvent;
use crate::message::InboundMessage;
use crate::retry::{RetryPolicy, RetryState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;

/// Receive loop for one consumer queue
///
/// Each iteration waits for a free concurrency slot, receives, and hands the
/// messages to the dispatcher, one spawned task per dispatch unit. Receive
/// failures are reported and retried with exponential backoff; the loop only
/// exits when the shutdown token is cancelled. On exit it drains in-flight
/// dispatches, bounded by the shutdown timeout, and emits `Stopped`. A
/// receive still outstanding at shutdown is dropped, unless
/// `terminate_visibility_timeout` is set, in which case it is allowed to
/// finish and whatever it returns is made visible again.
pub struct Poller {
    dispatcher: Dispatcher,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    backoff: RetryPolicy,
}

impl Poller {
    /// Create a poller; nothing is received until [`Poller::run`] is awaited
    ///
    /// # Arguments
    ///
    /// * `dispatcher` - Dispatcher for the queue; its options size the concurrency limit and receive backoff
    /// * `shutdown` - Token that ends the loop when cancelled
    /// * `shutdown_timeout` - Upper bound on draining in-flight dispatches after shutdown
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use queue_dispatch::dispatcher::Dispatcher;
    /// use queue_dispatch::poller::Poller;
    /// use queue_dispatch::{
    ///     ConsumerOptions, EventEmitter, Handler, InMemoryTransport, QueueName, QueueRef,
    /// };
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # tokio_test::block_on(async {
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
    /// let shutdown = CancellationToken::new();
    /// let poller = Poller::new(dispatcher, shutdown.clone(), Duration::from_secs(30));
    /// let running = tokio::spawn(poller.run());
    ///
    /// tokio::time::sleep(Duration::from_secs(1)).await;
    /// shutdown.cancel();
    /// running.await.unwrap();
    /// # });
    /// ```
    pub fn new(dispatcher: Dispatcher, shutdown: CancellationToken, shutdown_timeout: Duration) -> Self {
        let options = dispatcher.options();
        let semaphore = Arc::new(Semaphore::new(options.concurrency_limit));
        let backoff = RetryPolicy::from_backoff(&options.error_backoff);

        Self {
            dispatcher,
            semaphore,
            tracker: TaskTracker::new(),
            shutdown,
            shutdown_timeout,
            backoff,
        }
    }

    /// Number of free concurrency slots
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Poll until shutdown, then drain and emit `Stopped`
    pub async fn run(self) {
        let queue = self.dispatcher.queue().clone();
        let request = self.dispatcher.options().receive_request();
        let polling_wait = Duration::from_millis(self.dispatcher.options().polling_wait_time_ms);
        let mut retry = RetryState::new();

        info!(queue = %queue.name(), "Poller started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Backpressure: never receive without room for at least one unit.
            let first_permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let mut receive = self.dispatcher.transport().receive(&queue, &request);
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = &mut receive => Some(result),
            };
            let Some(received) = received else {
                self.finish_interrupted_receive(receive).await;
                break;
            };

            match received {
                Ok(messages) if messages.is_empty() => {
                    retry.reset();
                    drop(first_permit);
                    debug!(queue = %queue.name(), "Receive returned no messages");
                    self.dispatcher.emit(ConsumerEvent::Empty {
                        queue: queue.name().clone(),
                    });
                }
                Ok(messages) => {
                    retry.reset();
                    debug!(queue = %queue.name(), count = messages.len(), "Received messages");
                    self.hand_off(messages, first_permit).await;
                }
                Err(error) => {
                    drop(first_permit);
                    let delay = retry.on_failure(&self.backoff, &error);
                    warn!(
                        queue = %queue.name(),
                        error = %error,
                        attempt = retry.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Receive failed; backing off"
                    );
                    self.dispatcher.emit(ConsumerEvent::Error {
                        queue: queue.name().clone(),
                        error: Arc::new(error),
                        message: None,
                    });

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }

            if !polling_wait.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(polling_wait) => {}
                }
            }
        }

        self.drain().await;

        info!(queue = %queue.name(), "Poller stopped");
        self.dispatcher.emit(ConsumerEvent::Stopped {
            queue: queue.name().clone(),
        });
    }

    /// Spawn one dispatch per unit, acquiring a slot for each
    async fn hand_off(&self, messages: Vec<InboundMessage>, first_permit: OwnedSemaphorePermit) {
        let mut units = self.dispatcher.units(messages).into_iter();
        let mut next_permit = Some(first_permit);
        let mut handles = Vec::new();
        let mut handed_off = 0;

        while let Some(unit) = units.next() {
            let permit = match next_permit.take() {
                Some(permit) => permit,
                None => {
                    let acquired = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => None,
                        permit = self.semaphore.clone().acquire_owned() => permit.ok(),
                    };
                    match acquired {
                        Some(permit) => permit,
                        None => {
                            let remaining: Vec<InboundMessage> =
                                std::iter::once(unit).chain(units).flatten().collect();
                            self.abandon(remaining).await;
                            break;
                        }
                    }
                }
            };

            handed_off += unit.len();
            let dispatcher = self.dispatcher.clone();
            handles.push(
                self.tracker
                    .spawn(async move { dispatcher.dispatch(unit, permit).await }),
            );
        }

        if handles.is_empty() {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        self.tracker.spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            dispatcher.emit(ConsumerEvent::ResponseProcessed {
                queue: dispatcher.queue().name().clone(),
                message_count: handed_off,
            });
        });
    }

    /// Settle a receive that was in progress when shutdown was signalled
    ///
    /// Without `terminate_visibility_timeout` the call is dropped and any
    /// messages it was about to return reappear once their visibility
    /// timeout expires. With it, the call is allowed to finish, bounded by
    /// the shutdown timeout, and whatever it returns is released at once.
    async fn finish_interrupted_receive<F>(&self, receive: F)
    where
        F: Future<Output = Result<Vec<InboundMessage>, QueueError>>,
    {
        if !self.dispatcher.options().terminate_visibility_timeout {
            return;
        }

        match tokio::time::timeout(self.shutdown_timeout, receive).await {
            Ok(Ok(messages)) if !messages.is_empty() => self.abandon(messages).await,
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                debug!(queue = %self.dispatcher.queue().name(), error = %error, "Receive failed during shutdown");
            }
            Err(_) => {
                warn!(
                    queue = %self.dispatcher.queue().name(),
                    "Receive still pending after shutdown grace period; dropping it"
                );
            }
        }
    }

    /// Messages received but never handed off because of shutdown
    async fn abandon(&self, messages: Vec<InboundMessage>) {
        debug!(
            queue = %self.dispatcher.queue().name(),
            count = messages.len(),
            "Shutdown before hand-off; leaving messages"
        );
        if self.dispatcher.options().terminate_visibility_timeout {
            self.dispatcher.release(&messages).await;
        }
    }

    /// Wait for in-flight dispatches, aborting whatever outlives the grace period
    async fn drain(&self) {
        self.tracker.close();
        let in_flight = self.dispatcher.in_flight();

        if self.dispatcher.options().terminate_visibility_timeout {
            let aborted = in_flight.abort_all();
            if aborted > 0 {
                debug!(queue = %self.dispatcher.queue().name(), aborted, "Aborting in-flight handlers");
            }
        }

        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            let aborted = in_flight.abort_all();
            warn!(
                queue = %self.dispatcher.queue().name(),
                aborted,
                "Shutdown grace period elapsed; aborting in-flight handlers"
            );
            self.tracker.wait().await;
        }
    }
}

//! Periodic visibility extension for messages whose handler is still running.

use crate::client::{QueueRef, QueueTransport};
use crate::in_flight::InFlightRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "visibility_tests.rs"]
mod tests;

/// Background task that keeps one in-flight record's messages invisible
///
/// Every `interval` it resets the visibility timeout of each message to
/// `visibility_timeout_seconds`, never reaching past the record's
/// extension deadline. Extension failures are logged and otherwise ignored.
pub struct VisibilityExtender {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl VisibilityExtender {
    /// Start extending on the current runtime
    ///
    /// The first extension happens one `interval` after the call. The task
    /// stops on its own once the record is settled or aborted.
    ///
    /// # Arguments
    ///
    /// * `transport` - Transport used for the visibility change calls
    /// * `queue` - Queue the record's messages were received from
    /// * `record` - In-flight record whose messages are kept invisible
    /// * `interval` - Time between extensions
    /// * `visibility_timeout_seconds` - Visibility requested on each extension, capped by the record's deadline
    pub fn spawn(
        transport: Arc<dyn QueueTransport>,
        queue: QueueRef,
        record: Arc<InFlightRecord>,
        interval: Duration,
        visibility_timeout_seconds: u32,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                if record.is_settled() || record.is_aborted() {
                    return;
                }

                let remaining = record
                    .extension_deadline()
                    .saturating_duration_since(Instant::now())
                    .as_secs();
                if remaining == 0 {
                    debug!(queue = %queue.name(), record = %record.id(), "Maximum visibility extension reached");
                    return;
                }
                let extension = u64::from(visibility_timeout_seconds).min(remaining) as u32;

                for message in record.messages() {
                    if token.is_cancelled() {
                        return;
                    }
                    match transport
                        .change_visibility(&queue, &message.receipt_handle, extension)
                        .await
                    {
                        Ok(()) => debug!(
                            queue = %queue.name(),
                            message_id = %message.message_id,
                            seconds = extension,
                            "Extended message visibility"
                        ),
                        Err(e) => warn!(
                            queue = %queue.name(),
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to extend message visibility"
                        ),
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop extending and wait until no extension call is outstanding
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for VisibilityExtender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

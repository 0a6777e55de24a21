//! Long-poll consume loop for the relay queue.
//!
//! ```text
//! Polling -> Processing -> Polling   (messages received)
//! Polling -> Polling                 (empty receive)
//! Polling -> Backoff -> Polling      (receive failed)
//! any     -> Stopped                 (shutdown)
//! ```
//!
//! A message is deleted only after its handler succeeds. On decode or handler
//! failure it is left alone and reappears after the visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{FanoutClient, Notification, ReceivedMessage};
use crate::bus::{Envelope, EventHandler, Result};
use crate::utils::retry;
use crate::utils::shutdown::Shutdown;

/// Receive tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Messages per receive, at most 10.
    pub max_messages: i32,
    /// Long-poll wait, at most 20 seconds.
    pub wait_time_secs: i32,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time_secs: 20,
            error_backoff: retry::DEFAULT_POLL_ERROR_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Processing,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub received: u64,
    pub deleted: u64,
    /// Left on the queue after decode or handler failure.
    pub retained: u64,
    pub receive_errors: u64,
}

/// Polls one queue and dispatches unwrapped envelopes to a handler.
pub struct PollLoop {
    client: Arc<dyn FanoutClient>,
    queue_url: String,
    handler: Arc<dyn EventHandler>,
    settings: PollSettings,
    state: watch::Sender<PollState>,
    stats: watch::Sender<PollStats>,
}

impl PollLoop {
    pub fn new(
        client: Arc<dyn FanoutClient>,
        queue_url: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        settings: PollSettings,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Polling);
        let (stats, _) = watch::channel(PollStats::default());
        Self {
            client,
            queue_url: queue_url.into(),
            handler,
            settings,
            state,
            stats,
        }
    }

    pub fn state(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> watch::Receiver<PollStats> {
        self.stats.subscribe()
    }

    pub fn snapshot(&self) -> PollStats {
        *self.stats.borrow()
    }

    fn transition(&self, next: PollState) {
        self.state.send_replace(next);
    }

    fn record(&self, update: impl FnOnce(&mut PollStats)) {
        self.stats.send_modify(update);
    }

    /// Poll until shutdown. Returns the final counters.
    pub async fn run(&self, mut shutdown: Shutdown) -> PollStats {
        let mut backoff = retry::delays(
            retry::poll_error_backoff(self.settings.error_backoff),
            self.settings.error_backoff,
        );
        info!(queue_url = %self.queue_url, "Polling for messages");

        'poll: loop {
            if shutdown.is_triggered() {
                break;
            }
            self.transition(PollState::Polling);

            let batch = tokio::select! {
                _ = shutdown.wait() => break,
                batch = self.client.receive(
                    &self.queue_url,
                    self.settings.max_messages,
                    self.settings.wait_time_secs,
                ) => batch,
            };

            match batch {
                Ok(messages) if messages.is_empty() => {
                    debug!("No messages received");
                }
                Ok(messages) => {
                    self.transition(PollState::Processing);
                    debug!(count = messages.len(), "Received messages");
                    for message in messages {
                        if shutdown.is_triggered() {
                            break 'poll;
                        }
                        self.process(message).await;
                    }
                }
                Err(e) => {
                    self.record(|s| s.receive_errors += 1);
                    self.transition(PollState::Backoff);
                    let delay = backoff.next().unwrap_or(self.settings.error_backoff);
                    error!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        self.transition(PollState::Stopped);
        let stats = self.snapshot();
        info!(
            queue_url = %self.queue_url,
            received = stats.received,
            deleted = stats.deleted,
            retained = stats.retained,
            "Poll loop stopped"
        );
        stats
    }

    #[tracing::instrument(name = "fanout.process", skip_all, fields(message_id = %message.message_id))]
    async fn process(&self, message: ReceivedMessage) {
        self.record(|s| s.received += 1);

        if let Err(e) = self.dispatch(&message).await {
            self.record(|s| s.retained += 1);
            error!(error = %e, "Processing failed, message left for redelivery");
            return;
        }

        match self
            .client
            .delete(&self.queue_url, &message.receipt_handle)
            .await
        {
            Ok(()) => {
                self.record(|s| s.deleted += 1);
                debug!("Message deleted");
            }
            Err(e) => warn!(error = %e, "Failed to delete processed message"),
        }
    }

    async fn dispatch(&self, message: &ReceivedMessage) -> Result<()> {
        let notification = Notification::from_body(&message.body)?;
        let envelope = Envelope::from_json(&notification.message)?;
        debug!(
            event_type = envelope.event_type(),
            subject = ?notification.subject,
            "Dispatching notification"
        );
        self.handler.handle(Arc::new(envelope)).await?;
        Ok(())
    }
}

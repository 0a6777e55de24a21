//! Durable queue consumer.
//!
//! One consumer per queue, one delivery in flight at a time. Per delivery:
//! decode the envelope, run the handler, then ack on success. A decode
//! failure counts as a handler failure; the loop never stops for either.
//!
//! Failure handling is chosen by [`RedeliveryPolicy`]:
//! - `Unbounded` (default): nack with requeue, forever.
//! - `Bounded`: republish with `x-redelivery-count + 1` and ack the original;
//!   once the count reaches `max_redeliveries` the message goes to the
//!   dead-letter queue instead.
//!
//! The handler is never cancelled by shutdown: shutdown is only observed while
//! waiting for the next delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::connection::Session;
use super::topology::{provision, QueueBinding};
use super::{BrokerChannel, BrokerConnection, Delivery, QueueOptions};
use crate::bus::{BusError, Envelope, EventHandler, Result};
use crate::utils::shutdown::Shutdown;

fn default_prefetch() -> u16 {
    1
}

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// Nack with requeue every time.
    #[default]
    Unbounded,
    /// Retry up to `max_redeliveries` times, then park in `dead_letter_queue`.
    Bounded {
        max_redeliveries: u32,
        dead_letter_queue: String,
    },
}

/// Consumer registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub exchange: String,
    pub queue: String,
    pub routing_pattern: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// Defaults to `<queue>-consumer`.
    #[serde(default)]
    pub consumer_tag: Option<String>,
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
}

impl ConsumerConfig {
    /// Prefetch 1, unbounded redelivery.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_pattern: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_pattern: routing_pattern.into(),
            prefetch: default_prefetch(),
            consumer_tag: None,
            redelivery: RedeliveryPolicy::Unbounded,
        }
    }

    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn consumer_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-consumer", self.queue))
    }

    pub fn binding(&self) -> QueueBinding {
        QueueBinding::durable(&self.exchange, &self.queue, &self.routing_pattern)
    }
}

/// Per-consumer delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

/// Consumes one queue and dispatches each envelope to a handler.
pub struct QueueConsumer {
    config: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
    stats: watch::Sender<ConsumerStats>,
}

impl QueueConsumer {
    pub fn new(config: ConsumerConfig, handler: Arc<dyn EventHandler>) -> Self {
        let (stats, _) = watch::channel(ConsumerStats::default());
        Self {
            config,
            handler,
            stats,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Live view of the counters.
    pub fn stats(&self) -> watch::Receiver<ConsumerStats> {
        self.stats.subscribe()
    }

    pub fn snapshot(&self) -> ConsumerStats {
        *self.stats.borrow()
    }

    fn record(&self, update: impl FnOnce(&mut ConsumerStats)) {
        self.stats.send_modify(update);
    }

    /// Provision topology, then consume until shutdown or connection loss.
    ///
    /// Returns `Ok` only on shutdown. A lost connection surfaces as
    /// `BusError::Connection` so the supervisor can reconnect.
    pub async fn consume(&self, connection: &dyn BrokerConnection, mut shutdown: Shutdown) -> Result<()> {
        let channel = connection.create_channel().await?;
        provision(channel.as_ref(), &self.config.binding()).await?;
        if let RedeliveryPolicy::Bounded {
            dead_letter_queue, ..
        } = &self.config.redelivery
        {
            channel
                .declare_queue(dead_letter_queue, QueueOptions::default())
                .await?;
        }
        channel.set_prefetch(self.config.prefetch).await?;

        let tag = self.config.consumer_tag();
        let mut stream = channel.consume(&self.config.queue, &tag).await?;
        info!(
            queue = %self.config.queue,
            routing_pattern = %self.config.routing_pattern,
            prefetch = self.config.prefetch,
            consumer_tag = %tag,
            "Consumer started, waiting for messages"
        );

        loop {
            let delivery = tokio::select! {
                _ = shutdown.wait() => {
                    info!(queue = %self.config.queue, "Consumer stopping");
                    let _ = channel.close().await;
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(BusError::Connection(format!(
                            "delivery stream for '{}' ended",
                            self.config.queue
                        )))
                    }
                },
            };
            self.process(channel.as_ref(), delivery).await?;
        }
    }

    #[tracing::instrument(
        name = "bus.consume",
        skip_all,
        fields(queue = %self.config.queue, routing_key = %delivery.routing_key, redelivered = delivery.redelivered)
    )]
    async fn process(&self, channel: &dyn BrokerChannel, delivery: Delivery) -> Result<()> {
        self.record(|s| s.delivered += 1);

        let outcome = match Envelope::from_slice(&delivery.payload) {
            Ok(envelope) => {
                debug!(event_type = envelope.event_type(), "Received event");
                self.handler
                    .handle(Arc::new(envelope))
                    .await
                    .map_err(BusError::from)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                delivery.ack().await?;
                self.record(|s| s.acked += 1);
                debug!("Message acknowledged");
            }
            Err(e) => {
                error!(error = %e, "Processing failed");
                self.settle_failure(channel, delivery).await?;
            }
        }
        Ok(())
    }

    async fn settle_failure(&self, channel: &dyn BrokerChannel, delivery: Delivery) -> Result<()> {
        match &self.config.redelivery {
            RedeliveryPolicy::Unbounded => {
                delivery.nack(true).await?;
                self.record(|s| s.requeued += 1);
                warn!("Message returned to queue");
            }
            RedeliveryPolicy::Bounded {
                max_redeliveries,
                dead_letter_queue,
            } => {
                let count = delivery.properties.redelivery_count;
                if count >= *max_redeliveries {
                    channel
                        .publish(
                            "",
                            dead_letter_queue,
                            delivery.payload.clone(),
                            delivery.properties.clone(),
                        )
                        .await?;
                    delivery.ack().await?;
                    self.record(|s| s.dead_lettered += 1);
                    warn!(
                        redeliveries = count,
                        dead_letter_queue = %dead_letter_queue,
                        "Redelivery limit reached, message dead-lettered"
                    );
                } else {
                    channel
                        .publish(
                            "",
                            &self.config.queue,
                            delivery.payload.clone(),
                            delivery.properties.with_redelivery_count(count + 1),
                        )
                        .await?;
                    delivery.ack().await?;
                    self.record(|s| s.requeued += 1);
                    warn!(redeliveries = count + 1, "Message republished for retry");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for QueueConsumer {
    fn name(&self) -> &str {
        &self.config.queue
    }

    async fn run(&self, connection: Arc<dyn BrokerConnection>, shutdown: Shutdown) -> Result<()> {
        self.consume(connection.as_ref(), shutdown).await
    }
}

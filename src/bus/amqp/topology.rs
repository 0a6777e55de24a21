//! Idempotent exchange/queue/binding provisioning.
//!
//! Consumers provision in a fixed order before consuming: declare topic,
//! declare queue, bind. Re-running against an existing identical topology is
//! a no-op; differing parameters surface as `BusError::TopologyConflict`.

use tracing::{debug, info};

use super::{BrokerChannel, QueueOptions, TopicOptions};
use crate::bus::routing::validate_pattern;
use crate::bus::Result;

/// A queue bound to a topic by one or more routing patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub topic: String,
    pub topic_options: TopicOptions,
    pub queue: String,
    pub queue_options: QueueOptions,
    pub patterns: Vec<String>,
}

impl QueueBinding {
    /// Durable topic exchange and durable queue bound by one pattern.
    pub fn durable(
        topic: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            topic_options: TopicOptions::default(),
            queue: queue.into(),
            queue_options: QueueOptions::default(),
            patterns: vec![pattern.into()],
        }
    }

    /// Add another routing pattern for the same queue.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.patterns.iter().try_for_each(|p| validate_pattern(p))
    }
}

/// Declare `name` as an exchange.
pub async fn declare_topic(
    channel: &dyn BrokerChannel,
    name: &str,
    options: TopicOptions,
) -> Result<()> {
    channel.declare_topic(name, options).await?;
    debug!(exchange = %name, durable = options.durable, "Declared exchange");
    Ok(())
}

/// Declare topic, queue and bindings, in that order.
pub async fn provision(channel: &dyn BrokerChannel, binding: &QueueBinding) -> Result<()> {
    binding.validate()?;

    declare_topic(channel, &binding.topic, binding.topic_options).await?;

    channel
        .declare_queue(&binding.queue, binding.queue_options)
        .await?;
    debug!(queue = %binding.queue, durable = binding.queue_options.durable, "Declared queue");

    for pattern in &binding.patterns {
        channel
            .bind_queue(&binding.queue, &binding.topic, pattern)
            .await?;
    }

    info!(
        exchange = %binding.topic,
        queue = %binding.queue,
        patterns = ?binding.patterns,
        "Bound queue to exchange"
    );
    Ok(())
}

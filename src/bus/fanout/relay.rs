//! Relay setup: bridge a topic into a polled queue.
//!
//! Five steps, each safe to repeat:
//! 1. ensure the topic exists (create it on NotFound)
//! 2. ensure the queue exists (resolve its URL if it already exists)
//! 3. fetch the queue ARN
//! 4. subscribe the queue to the topic, reusing an identical subscription
//! 5. install a policy letting only that topic send into the queue
//!
//! Any failure is `BusError::RelaySetup`, fatal to the fan-out path.

use tracing::{debug, info};

use super::{FanoutClient, FanoutError, QueuePolicy, TopicRef, QUEUE_PROTOCOL};
use crate::bus::{BusError, Result};

/// A provisioned relay queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayQueue {
    pub topic_arn: String,
    pub queue_url: String,
    pub queue_arn: String,
    pub subscription_arn: String,
}

fn step<T>(step: &'static str, result: std::result::Result<T, FanoutError>) -> Result<T> {
    result.map_err(|source| BusError::RelaySetup { step, source })
}

/// Provision the relay from `topic_arn` into `queue_name`.
pub async fn setup_relay(
    client: &dyn FanoutClient,
    topic_arn: &str,
    queue_name: &str,
) -> Result<RelayQueue> {
    let topic_arn = step("ensure topic", ensure_topic(client, topic_arn).await)?;
    let queue_url = step("ensure queue", ensure_queue(client, queue_name).await)?;
    let queue_arn = step("fetch queue ARN", client.queue_arn(&queue_url).await)?;
    let subscription_arn = step(
        "subscribe queue",
        ensure_subscription(client, &topic_arn, &queue_arn).await,
    )?;

    let policy = step(
        "build queue policy",
        QueuePolicy::allow_topic(&queue_arn, &topic_arn).to_json(),
    )?;
    step(
        "set queue policy",
        client.set_queue_policy(&queue_url, &policy).await,
    )?;

    info!(
        topic_arn = %topic_arn,
        queue_url = %queue_url,
        subscription_arn = %subscription_arn,
        "Relay queue ready"
    );

    Ok(RelayQueue {
        topic_arn,
        queue_url,
        queue_arn,
        subscription_arn,
    })
}

async fn ensure_topic(
    client: &dyn FanoutClient,
    topic_arn: &str,
) -> std::result::Result<String, FanoutError> {
    match client.topic_exists(topic_arn).await {
        Ok(()) => {
            debug!(topic_arn = %topic_arn, "Topic exists");
            Ok(topic_arn.to_string())
        }
        Err(FanoutError::NotFound(_)) => {
            let topic = TopicRef::from_arn(topic_arn)?;
            let created = client.create_topic(&topic.name).await?;
            info!(topic = %topic.name, arn = %created, "Created topic");
            Ok(created)
        }
        Err(e) => Err(e),
    }
}

async fn ensure_queue(
    client: &dyn FanoutClient,
    queue_name: &str,
) -> std::result::Result<String, FanoutError> {
    match client.create_queue(queue_name).await {
        Ok(url) => {
            info!(queue = %queue_name, url = %url, "Created queue");
            Ok(url)
        }
        Err(FanoutError::QueueAlreadyExists(_)) => {
            let url = client.queue_url(queue_name).await?;
            debug!(queue = %queue_name, url = %url, "Queue already exists");
            Ok(url)
        }
        Err(e) => Err(e),
    }
}

async fn ensure_subscription(
    client: &dyn FanoutClient,
    topic_arn: &str,
    queue_arn: &str,
) -> std::result::Result<String, FanoutError> {
    let existing = client
        .list_subscriptions(topic_arn)
        .await?
        .into_iter()
        .find(|s| s.protocol == QUEUE_PROTOCOL && s.endpoint == queue_arn);

    if let Some(subscription) = existing {
        debug!(subscription_arn = %subscription.subscription_arn, "Reusing subscription");
        return Ok(subscription.subscription_arn);
    }

    let arn = client.subscribe(topic_arn, QUEUE_PROTOCOL, queue_arn).await?;
    info!(subscription_arn = %arn, "Subscribed queue to topic");
    Ok(arn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fanout::InMemoryFanout;

    const TOPIC: &str = "arn:aws:sns:us-east-1:000000000000:items-notifications";

    #[tokio::test]
    async fn test_creates_missing_topic() {
        let fanout = InMemoryFanout::new();
        let relay = setup_relay(&fanout, TOPIC, "items-notifications-queue")
            .await
            .unwrap();
        assert_eq!(relay.topic_arn, TOPIC);
        assert!(fanout.topic_exists(TOPIC).await.is_ok());
        assert_eq!(fanout.subscription_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_setup_twice_is_idempotent() {
        let fanout = InMemoryFanout::new();
        let first = setup_relay(&fanout, TOPIC, "items-notifications-queue")
            .await
            .unwrap();
        let second = setup_relay(&fanout, TOPIC, "items-notifications-queue")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(fanout.subscription_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_failure_is_relay_setup_error() {
        let fanout = InMemoryFanout::new();
        fanout.set_unavailable(true);

        let err = setup_relay(&fanout, TOPIC, "q").await.unwrap_err();
        assert!(matches!(
            err,
            BusError::RelaySetup {
                step: "ensure topic",
                source: FanoutError::Transport(_)
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_topic_arn() {
        let fanout = InMemoryFanout::new();
        let err = setup_relay(&fanout, "not-an-arn", "q").await.unwrap_err();
        assert!(matches!(err, BusError::RelaySetup { step: "ensure topic", .. }));
    }
}

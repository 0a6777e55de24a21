//! Relay subscriber process: provision the topic→queue relay, then poll it.

use std::sync::Arc;

use tracing::info;

use crate::bus::fanout::{setup_relay, FanoutClient, PollLoop, PollStats};
use crate::bus::{EventHandler, Result};
use crate::config::FanoutConfig;
use crate::utils::shutdown::Shutdown;

/// Set up the relay described by `fanout` and dispatch its messages to
/// `handler` until shutdown.
///
/// Relay setup failures are returned as `BusError::RelaySetup` before any
/// polling starts.
pub async fn run_relay_subscriber(
    client: Arc<dyn FanoutClient>,
    fanout: &FanoutConfig,
    handler: Arc<dyn EventHandler>,
    shutdown: Shutdown,
) -> Result<PollStats> {
    info!(
        topic_arn = %fanout.topic_arn,
        queue = %fanout.queue_name,
        "Starting relay subscriber"
    );

    let relay = setup_relay(client.as_ref(), &fanout.topic_arn, &fanout.queue_name).await?;
    let poll = PollLoop::new(client, relay.queue_url, handler, fanout.poll_settings());

    Ok(poll.run(shutdown).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fanout::InMemoryFanout;
    use crate::bus::{BusError, DomainEvent, Envelope, Item, ItemNotification};
    use crate::handlers::ItemNotificationHandler;
    use crate::utils::shutdown;
    use std::time::Duration;

    fn fanout_config() -> FanoutConfig {
        FanoutConfig {
            wait_time_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_relays_topic_messages() {
        let service = InMemoryFanout::new();
        let handler = Arc::new(ItemNotificationHandler::new());
        let (trigger, listener) = shutdown::channel();
        let config = fanout_config();

        let task = {
            let service = service.clone();
            let handler = handler.clone();
            let config = config.clone();
            tokio::spawn(async move {
                run_relay_subscriber(Arc::new(service), &config, handler, listener).await
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !service.has_policy(&config.queue_name) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let envelope = Envelope::now(DomainEvent::ItemCreated(ItemNotification {
            item: Item {
                id: "i-1".to_string(),
                name: "Leite".to_string(),
                quantity: 2,
                category: None,
                purchased: false,
                created_at: None,
                updated_at: None,
            },
            previous_item: None,
        }));
        let message = String::from_utf8(envelope.to_vec().unwrap()).unwrap();
        service
            .publish(&config.topic_arn, &message, Some("New item: Leite"))
            .await
            .unwrap();

        let mut stats = handler.subscribe();
        tokio::time::timeout(Duration::from_secs(5), stats.wait_for(|s| s.created == 1))
            .await
            .unwrap()
            .unwrap();

        trigger.trigger();
        let poll = task.await.unwrap().unwrap();
        assert_eq!(poll.received, 1);
        assert_eq!(poll.deleted, 1);
        assert_eq!(service.queue_depth(&config.queue_name), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_is_returned() {
        let service = InMemoryFanout::new();
        service.set_unavailable(true);
        let (_trigger, listener) = shutdown::channel();

        let result = run_relay_subscriber(
            Arc::new(service),
            &fanout_config(),
            Arc::new(ItemNotificationHandler::new()),
            listener,
        )
        .await;

        assert!(matches!(result, Err(BusError::RelaySetup { step: "ensure topic", .. })));
    }
}

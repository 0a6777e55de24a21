//! Queue consumer process: connection manager + one queue consumer.

use std::sync::Arc;

use tracing::info;

use crate::bus::amqp::{ConnectionManager, ConsumerConfig, ConsumerStats, Connector, QueueConsumer};
use crate::bus::{EventHandler, Result};
use crate::config::AmqpConfig;
use crate::utils::shutdown::Shutdown;

/// Consume `consumer.queue` with `handler`, reconnecting on connection loss,
/// until shutdown.
///
/// Returns the consumer counters, or the fatal error that stopped it.
pub async fn run_queue_consumer(
    connector: Arc<dyn Connector>,
    amqp: &AmqpConfig,
    consumer: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
    shutdown: Shutdown,
) -> Result<ConsumerStats> {
    info!(
        endpoint = %connector.endpoint(),
        exchange = %consumer.exchange,
        queue = %consumer.queue,
        pattern = %consumer.routing_pattern,
        prefetch = consumer.prefetch,
        "Starting queue consumer"
    );

    let manager = ConnectionManager::new(connector, amqp.reconnect_delay());
    let consumer = QueueConsumer::new(consumer, handler);

    manager.run(&consumer, shutdown).await?;

    let stats = consumer.snapshot();
    info!(
        queue = %consumer.config().queue,
        delivered = stats.delivered,
        acked = stats.acked,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        "Queue consumer stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::amqp::{InMemoryBroker, MessageProperties};
    use crate::bus::{CheckoutCompleted, DomainEvent, Envelope};
    use crate::handlers::NotificationHandler;
    use crate::utils::shutdown;
    use std::time::Duration;

    fn checkout_payload() -> Vec<u8> {
        Envelope::now(DomainEvent::CheckoutCompleted(CheckoutCompleted {
            list_id: "1".to_string(),
            user_id: "u".to_string(),
            user_email: "u@email.com".to_string(),
            user_name: "U".to_string(),
            list_name: "Semanal".to_string(),
            items: Vec::new(),
            total_amount: 10.0,
            item_count: 1,
        }))
        .to_vec()
        .unwrap()
    }

    #[tokio::test]
    async fn test_consumes_until_shutdown() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(NotificationHandler::new(Duration::ZERO));
        let (trigger, listener) = shutdown::channel();
        let amqp = AmqpConfig::default();
        let config = ConsumerConfig::new("shopping_events", "notification_queue", "list.checkout.#");

        let task = {
            let broker = broker.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                run_queue_consumer(Arc::new(broker), &amqp, config, handler, listener).await
            })
        };

        // Wait for the binding before publishing.
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.binding_count("shopping_events") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .publish(
                "shopping_events",
                "list.checkout.completed",
                checkout_payload(),
                MessageProperties::persistent_json("m-1"),
            )
            .await
            .unwrap();

        let mut sent = handler.subscribe();
        tokio::time::timeout(Duration::from_secs(5), sent.wait_for(|s| s.len() == 1))
            .await
            .unwrap()
            .unwrap();

        trigger.trigger();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(broker.queue_depth("notification_queue"), 0);
    }
}

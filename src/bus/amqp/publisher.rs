//! Persistent JSON publisher.
//!
//! The publisher holds at most one channel. It is filled when a session
//! attaches to a live connection and cleared as soon as that connection
//! reports closed; publishing in between fails fast with
//! `BusError::ChannelUnavailable`. There is no buffering and no retry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::Session;
use super::topology::declare_topic;
use super::{BrokerChannel, BrokerConnection, MessageProperties, TopicOptions};
use crate::bus::{BusError, Envelope, PublishResult, Result};
use crate::utils::shutdown::Shutdown;

/// Hex SHA-256 of a payload, used as its message id.
pub fn content_id(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Attached channel, tagged with the attach that installed it so a late
/// close from an old connection cannot clear a newer channel.
#[derive(Default)]
struct ChannelSlot {
    generation: u64,
    channel: Option<Arc<dyn BrokerChannel>>,
}

/// Publishes envelopes to a topic exchange.
pub struct Publisher {
    exchange: String,
    exchange_options: TopicOptions,
    slot: Arc<Mutex<ChannelSlot>>,
    ready: Arc<watch::Sender<bool>>,
}

fn lock_slot(slot: &Mutex<ChannelSlot>) -> MutexGuard<'_, ChannelSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Publisher {
    /// Publisher for a durable topic exchange.
    pub fn new(exchange: impl Into<String>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            exchange: exchange.into(),
            exchange_options: TopicOptions::default(),
            slot: Arc::new(Mutex::new(ChannelSlot::default())),
            ready: Arc::new(ready),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until a channel is attached.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Open a channel on `connection`, declare the exchange and make the
    /// channel available for publishing until the connection closes.
    pub async fn attach(&self, connection: &dyn BrokerConnection) -> Result<()> {
        let channel = connection.create_channel().await?;
        declare_topic(channel.as_ref(), &self.exchange, self.exchange_options).await?;

        let generation = {
            let mut slot = lock_slot(&self.slot);
            slot.generation += 1;
            slot.channel = Some(channel);
            slot.generation
        };
        self.ready.send_replace(true);

        let slot = self.slot.clone();
        let ready = self.ready.clone();
        let exchange = self.exchange.clone();
        connection.on_closed(Box::new(move |reason| {
            let mut slot = lock_slot(&slot);
            if slot.generation == generation && slot.channel.take().is_some() {
                ready.send_replace(false);
                warn!(exchange = %exchange, reason = %reason, "Publisher channel lost");
            }
        }));

        info!(exchange = %self.exchange, "Publisher ready");
        Ok(())
    }

    /// Drop the current channel, if any.
    pub async fn detach(&self) {
        let previous = lock_slot(&self.slot).channel.take();
        self.ready.send_replace(false);
        if let Some(channel) = previous {
            let _ = channel.close().await;
            debug!(exchange = %self.exchange, "Publisher channel released");
        }
    }

    /// Publish to this publisher's exchange under the event's own routing key.
    pub async fn publish_event(&self, envelope: &Envelope) -> Result<PublishResult> {
        let routing_key = envelope.event.routing_key();
        self.publish(&self.exchange, &routing_key, envelope).await
    }

    /// Serialize `envelope` and publish it as a persistent JSON message.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic, routing_key = %routing_key))]
    pub async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PublishResult> {
        let channel = lock_slot(&self.slot)
            .channel
            .clone()
            .ok_or(BusError::ChannelUnavailable)?;

        let payload = envelope.to_vec()?;
        let message_id = content_id(&payload);
        let payload_len = payload.len();

        channel
            .publish(
                topic,
                routing_key,
                payload,
                MessageProperties::persistent_json(message_id.clone()),
            )
            .await?;

        debug!(
            event_type = envelope.event_type(),
            message_id = %message_id,
            bytes = payload_len,
            "Published event"
        );

        Ok(PublishResult {
            message_id,
            destination: routing_key.to_string(),
            payload_len,
        })
    }
}

#[async_trait]
impl Session for Publisher {
    fn name(&self) -> &str {
        "publisher"
    }

    async fn run(&self, connection: Arc<dyn BrokerConnection>, mut shutdown: Shutdown) -> Result<()> {
        self.attach(connection.as_ref()).await?;
        shutdown.wait().await;
        self.detach().await;
        Ok(())
    }

    async fn on_disconnected(&self) {
        self.detach().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::amqp::topology::{provision, QueueBinding};
    use crate::bus::amqp::{Connector, InMemoryBroker};
    use crate::bus::envelope::{CheckoutCompleted, DomainEvent};

    fn checkout() -> Envelope {
        Envelope::now(DomainEvent::CheckoutCompleted(CheckoutCompleted {
            list_id: "1".to_string(),
            user_id: "user123".to_string(),
            user_email: "joao@email.com".to_string(),
            user_name: "João Silva".to_string(),
            list_name: "Compras Semanais".to_string(),
            items: vec!["Arroz".to_string()],
            total_amount: 12.5,
            item_count: 1,
        }))
    }

    #[tokio::test]
    async fn test_publish_without_channel_fails_fast() {
        let publisher = Publisher::new("shopping_events");
        let err = publisher
            .publish("shopping_events", "list.checkout.completed", &checkout())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ChannelUnavailable));
        assert!(!publisher.is_ready());
    }

    #[tokio::test]
    async fn test_publish_sets_content_hash_and_routes() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let setup = conn.create_channel().await.unwrap();
        provision(
            setup.as_ref(),
            &QueueBinding::durable("shopping_events", "notification_queue", "list.checkout.#"),
        )
        .await
        .unwrap();

        let publisher = Publisher::new("shopping_events");
        publisher.attach(conn.as_ref()).await.unwrap();
        assert!(publisher.is_ready());

        let envelope = checkout();
        let result = publisher.publish_event(&envelope).await.unwrap();

        assert_eq!(result.destination, "list.checkout.completed");
        assert_eq!(result.message_id, content_id(&envelope.to_vec().unwrap()));
        assert_eq!(result.message_id.len(), 64);
        assert_eq!(broker.queue_depth("notification_queue"), 1);

        let mut stream = setup.consume("notification_queue", "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(delivery.properties.persistent);
        assert_eq!(delivery.properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(delivery.properties.message_id.as_deref(), Some(result.message_id.as_str()));
    }

    #[tokio::test]
    async fn test_detach_clears_channel() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let publisher = Publisher::new("shopping_events");
        publisher.attach(conn.as_ref()).await.unwrap();

        publisher.on_disconnected().await;

        assert!(!publisher.is_ready());
        assert!(matches!(
            publisher.publish_event(&checkout()).await,
            Err(BusError::ChannelUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_clears_channel_immediately() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let publisher = Publisher::new("shopping_events");
        publisher.attach(conn.as_ref()).await.unwrap();

        broker.drop_connections();

        assert!(!publisher.is_ready());
        assert!(matches!(
            publisher.publish_event(&checkout()).await,
            Err(BusError::ChannelUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_stale_close_keeps_newer_channel() {
        let broker = InMemoryBroker::new();
        let old = broker.connect().await.unwrap();
        let publisher = Publisher::new("shopping_events");
        publisher.attach(old.as_ref()).await.unwrap();

        let new = broker.connect().await.unwrap();
        publisher.attach(new.as_ref()).await.unwrap();
        old.close().await.unwrap();

        assert!(publisher.is_ready());
        publisher.publish_event(&checkout()).await.unwrap();
    }

    #[test]
    fn test_content_id_is_stable() {
        assert_eq!(content_id(b"abc"), content_id(b"abc"));
        assert_ne!(content_id(b"abc"), content_id(b"abd"));
        assert_eq!(
            content_id(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

//! Publishes envelopes to a fan-out topic.

use std::sync::Arc;

use tracing::debug;

use super::FanoutClient;
use crate::bus::amqp::publisher::content_id;
use crate::bus::{BusError, DomainEvent, Envelope, PublishResult, Result};

/// Publishes to one topic ARN.
pub struct FanoutPublisher {
    client: Arc<dyn FanoutClient>,
    topic_arn: String,
}

/// Subject line shown by mail/SMS subscribers of the topic.
pub fn subject_for(event: &DomainEvent) -> Option<String> {
    match event {
        DomainEvent::ItemCreated(n) => Some(format!("New item: {}", n.item.name)),
        DomainEvent::ItemUpdated(n) => Some(format!("Item updated: {}", n.item.name)),
        DomainEvent::CheckoutCompleted(c) => Some(format!("Checkout: {}", c.list_name)),
        DomainEvent::TaskSync(_) | DomainEvent::Unknown => None,
    }
}

impl FanoutPublisher {
    pub fn new(client: Arc<dyn FanoutClient>, topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            topic_arn: topic_arn.into(),
        }
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    #[tracing::instrument(name = "fanout.publish", skip_all, fields(topic_arn = %self.topic_arn))]
    pub async fn publish(&self, envelope: &Envelope) -> Result<PublishResult> {
        let payload = envelope.to_vec()?;
        let message_id = content_id(&payload);
        let message = String::from_utf8(payload)
            .map_err(|e| BusError::Publish(e.to_string()))?;
        let subject = subject_for(&envelope.event);

        let topic_message_id = self
            .client
            .publish(&self.topic_arn, &message, subject.as_deref())
            .await?;

        debug!(
            event_type = envelope.event_type(),
            message_id = %message_id,
            topic_message_id = %topic_message_id,
            "Published notification"
        );

        Ok(PublishResult {
            message_id,
            destination: self.topic_arn.clone(),
            payload_len: message.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{Item, ItemNotification};

    #[test]
    fn test_subject_for_item_events() {
        let item = Item {
            id: "1".to_string(),
            name: "Leite".to_string(),
            quantity: 2,
            category: None,
            purchased: false,
            created_at: None,
            updated_at: None,
        };
        let created = DomainEvent::ItemCreated(ItemNotification {
            item: item.clone(),
            previous_item: None,
        });
        assert_eq!(subject_for(&created).as_deref(), Some("New item: Leite"));
        assert_eq!(subject_for(&DomainEvent::Unknown), None);
    }
}

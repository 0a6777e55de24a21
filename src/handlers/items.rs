//! Item notifications received through the fan-out relay.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::{DomainEvent, Envelope, EventHandler, HandlerError, Item};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemStats {
    pub created: u64,
    pub updated: u64,
    /// Events other than item created/updated.
    pub skipped: u64,
}

/// Names of the fields that differ between two versions of an item.
pub fn changed_fields(previous: &Item, current: &Item) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if previous.name != current.name {
        changed.push("name");
    }
    if previous.quantity != current.quantity {
        changed.push("quantity");
    }
    if previous.category != current.category {
        changed.push("category");
    }
    if previous.purchased != current.purchased {
        changed.push("purchased");
    }
    changed
}

/// Logs item created/updated notifications.
pub struct ItemNotificationHandler {
    stats: Arc<watch::Sender<ItemStats>>,
}

impl Default for ItemNotificationHandler {
    fn default() -> Self {
        let (stats, _) = watch::channel(ItemStats::default());
        Self {
            stats: Arc::new(stats),
        }
    }
}

impl ItemNotificationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ItemStats {
        *self.stats.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ItemStats> {
        self.stats.subscribe()
    }
}

impl EventHandler for ItemNotificationHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let stats = self.stats.clone();

        Box::pin(async move {
            match &envelope.event {
                DomainEvent::ItemCreated(notification) => {
                    let item = &notification.item;
                    info!(
                        item_id = %item.id,
                        name = %item.name,
                        quantity = item.quantity,
                        "Item created"
                    );
                    stats.send_modify(|s| s.created += 1);
                }
                DomainEvent::ItemUpdated(notification) => {
                    let item = &notification.item;
                    match &notification.previous_item {
                        Some(previous) => info!(
                            item_id = %item.id,
                            name = %item.name,
                            changed = ?changed_fields(previous, item),
                            "Item updated"
                        ),
                        None => info!(item_id = %item.id, name = %item.name, "Item updated"),
                    }
                    stats.send_modify(|s| s.updated += 1);
                }
                other => {
                    warn!(event_type = other.event_type(), "Unexpected event on item topic");
                    stats.send_modify(|s| s.skipped += 1);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ItemNotification;

    fn item(name: &str, quantity: u32) -> Item {
        Item {
            id: "i-1".to_string(),
            name: name.to_string(),
            quantity,
            category: None,
            purchased: false,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_changed_fields() {
        let before = item("Leite", 1);
        let mut after = item("Leite integral", 2);
        after.purchased = true;
        assert_eq!(
            changed_fields(&before, &after),
            vec!["name", "quantity", "purchased"]
        );
        assert!(changed_fields(&before, &before).is_empty());
    }

    #[tokio::test]
    async fn test_counts_item_events() {
        let handler = ItemNotificationHandler::new();
        let created = DomainEvent::ItemCreated(ItemNotification {
            item: item("Leite", 1),
            previous_item: None,
        });
        let updated = DomainEvent::ItemUpdated(ItemNotification {
            item: item("Leite", 3),
            previous_item: Some(item("Leite", 1)),
        });

        handler.handle(Arc::new(Envelope::now(created))).await.unwrap();
        handler.handle(Arc::new(Envelope::now(updated))).await.unwrap();
        handler
            .handle(Arc::new(Envelope::now(DomainEvent::Unknown)))
            .await
            .unwrap();

        assert_eq!(
            handler.snapshot(),
            ItemStats {
                created: 1,
                updated: 1,
                skipped: 1,
            }
        );
    }
}

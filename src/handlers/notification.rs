//! Checkout receipt notifications.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bus::{DomainEvent, Envelope, EventHandler, HandlerError};

/// Simulated mail delivery time.
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(500);

/// A receipt that was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptNotice {
    pub list_id: String,
    pub recipient: String,
    pub list_name: String,
    pub item_count: u32,
    pub total_amount: f64,
}

/// Sends a receipt to the user for every completed checkout.
pub struct NotificationHandler {
    send_delay: Duration,
    sent: Arc<watch::Sender<Vec<ReceiptNotice>>>,
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_DELAY)
    }
}

impl NotificationHandler {
    pub fn new(send_delay: Duration) -> Self {
        let (sent, _) = watch::channel(Vec::new());
        Self {
            send_delay,
            sent: Arc::new(sent),
        }
    }

    /// Receipts sent so far.
    pub fn sent(&self) -> Vec<ReceiptNotice> {
        self.sent.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ReceiptNotice>> {
        self.sent.subscribe()
    }
}

impl EventHandler for NotificationHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let send_delay = self.send_delay;
        let sent = self.sent.clone();

        Box::pin(async move {
            let checkout = match &envelope.event {
                DomainEvent::CheckoutCompleted(checkout) => checkout,
                other => {
                    debug!(event_type = other.event_type(), "Skipping event without receipt");
                    return Ok(());
                }
            };

            info!(
                list_id = %checkout.list_id,
                recipient = %checkout.user_email,
                items = checkout.item_count,
                total = checkout.total_amount,
                "Sending checkout receipt"
            );

            tokio::time::sleep(send_delay).await;

            sent.send_modify(|sent| {
                sent.push(ReceiptNotice {
                    list_id: checkout.list_id.clone(),
                    recipient: checkout.user_email.clone(),
                    list_name: checkout.list_name.clone(),
                    item_count: checkout.item_count,
                    total_amount: checkout.total_amount,
                })
            });
            info!(
                list_id = %checkout.list_id,
                recipient = %checkout.user_email,
                "Receipt sent"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{CheckoutCompleted, Task, TaskOperation, TaskSync};

    fn checkout() -> Arc<Envelope> {
        Arc::new(Envelope::now(DomainEvent::CheckoutCompleted(CheckoutCompleted {
            list_id: "1".to_string(),
            user_id: "user123".to_string(),
            user_email: "joao@email.com".to_string(),
            user_name: "João Silva".to_string(),
            list_name: "Compras Semanais".to_string(),
            items: vec!["Arroz".to_string(), "Feijão".to_string()],
            total_amount: 45.5,
            item_count: 2,
        })))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_receipt_after_delay() {
        let handler = NotificationHandler::default();
        let start = tokio::time::Instant::now();

        handler.handle(checkout()).await.unwrap();

        assert!(start.elapsed() >= DEFAULT_SEND_DELAY);
        let sent = handler.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "joao@email.com");
        assert_eq!(sent[0].list_id, "1");
    }

    #[tokio::test]
    async fn test_skips_other_events() {
        let handler = NotificationHandler::new(Duration::ZERO);
        let envelope = Arc::new(Envelope::now(DomainEvent::TaskSync(TaskSync {
            operation: TaskOperation::Create,
            source: None,
            task: Task {
                id: "t".to_string(),
                title: "x".to_string(),
                description: None,
                completed: false,
                synced: false,
            },
        })));

        handler.handle(envelope).await.unwrap();
        handler.handle(Arc::new(Envelope::now(DomainEvent::Unknown))).await.unwrap();
        assert!(handler.sent().is_empty());
    }
}

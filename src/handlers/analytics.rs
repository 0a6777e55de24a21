//! Checkout analytics.
//!
//! Keeps running totals over `CHECKOUT_COMPLETED` events: number of checkouts,
//! revenue, items sold, average ticket and per-user spend. The aggregate lives
//! inside a `watch` channel owned by the handler; readers only see snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bus::{CheckoutCompleted, DomainEvent, Envelope, EventHandler, HandlerError};

/// Simulated processing time per checkout.
pub const DEFAULT_PROCESSING_DELAY: Duration = Duration::from_millis(300);

/// Number of users reported in [`AnalyticsSnapshot::top_users`].
pub const TOP_USERS: usize = 3;

/// Per-user checkout totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub user_name: String,
    pub checkouts: u64,
    pub total_spent: f64,
}

#[derive(Debug, Default)]
struct AnalyticsState {
    total_checkouts: u64,
    total_revenue: f64,
    total_items: u64,
    users: HashMap<String, UserStats>,
}

impl AnalyticsState {
    fn record(&mut self, checkout: &CheckoutCompleted) {
        self.total_checkouts += 1;
        self.total_revenue += checkout.total_amount;
        self.total_items += u64::from(checkout.item_count);

        let user = self
            .users
            .entry(checkout.user_id.clone())
            .or_insert_with(|| UserStats {
                user_id: checkout.user_id.clone(),
                user_name: checkout.user_name.clone(),
                checkouts: 0,
                total_spent: 0.0,
            });
        user.checkouts += 1;
        user.total_spent += checkout.total_amount;
    }

    fn snapshot(&self) -> AnalyticsSnapshot {
        let average_ticket = if self.total_checkouts == 0 {
            0.0
        } else {
            self.total_revenue / self.total_checkouts as f64
        };

        let mut top_users: Vec<UserStats> = self.users.values().cloned().collect();
        top_users.sort_by(|a, b| {
            b.total_spent
                .total_cmp(&a.total_spent)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        top_users.truncate(TOP_USERS);

        AnalyticsSnapshot {
            total_checkouts: self.total_checkouts,
            total_revenue: self.total_revenue,
            total_items: self.total_items,
            average_ticket,
            unique_users: self.users.len(),
            top_users,
        }
    }
}

/// Point-in-time view of the analytics aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub total_checkouts: u64,
    pub total_revenue: f64,
    pub total_items: u64,
    pub average_ticket: f64,
    pub unique_users: usize,
    /// Highest spenders first, at most [`TOP_USERS`].
    pub top_users: Vec<UserStats>,
}

/// Aggregates checkout statistics.
pub struct AnalyticsHandler {
    processing_delay: Duration,
    state: Arc<watch::Sender<AnalyticsState>>,
}

impl Default for AnalyticsHandler {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSING_DELAY)
    }
}

impl AnalyticsHandler {
    pub fn new(processing_delay: Duration) -> Self {
        let (state, _) = watch::channel(AnalyticsState::default());
        Self {
            processing_delay,
            state: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.state.borrow().snapshot()
    }

    /// Log the final statistics. Called once on shutdown.
    pub fn report(&self) {
        let snapshot = self.snapshot();
        let top_users = serde_json::to_string(&snapshot.top_users).unwrap_or_default();
        info!(
            total_checkouts = snapshot.total_checkouts,
            total_revenue = snapshot.total_revenue,
            total_items = snapshot.total_items,
            average_ticket = snapshot.average_ticket,
            unique_users = snapshot.unique_users,
            top_users = %top_users,
            "Final analytics"
        );
    }
}

impl EventHandler for AnalyticsHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let processing_delay = self.processing_delay;
        let state = self.state.clone();

        Box::pin(async move {
            let DomainEvent::CheckoutCompleted(checkout) = &envelope.event else {
                debug!(event_type = envelope.event_type(), "Skipping non-checkout event");
                return Ok(());
            };

            tokio::time::sleep(processing_delay).await;

            state.send_modify(|state| state.record(checkout));
            let snapshot = state.borrow().snapshot();
            info!(
                list_id = %checkout.list_id,
                user_id = %checkout.user_id,
                amount = checkout.total_amount,
                total_checkouts = snapshot.total_checkouts,
                total_revenue = snapshot.total_revenue,
                average_ticket = snapshot.average_ticket,
                "Checkout recorded"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout(list_id: &str, user_id: &str, amount: f64, items: u32) -> Arc<Envelope> {
        Arc::new(Envelope::now(DomainEvent::CheckoutCompleted(CheckoutCompleted {
            list_id: list_id.to_string(),
            user_id: user_id.to_string(),
            user_email: format!("{}@email.com", user_id),
            user_name: user_id.to_uppercase(),
            list_name: "Semanal".to_string(),
            items: Vec::new(),
            total_amount: amount,
            item_count: items,
        })))
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let handler = AnalyticsHandler::new(Duration::ZERO);
        let snapshot = handler.snapshot();
        assert_eq!(snapshot.total_checkouts, 0);
        assert_eq!(snapshot.average_ticket, 0.0);
        assert!(snapshot.top_users.is_empty());
    }

    #[tokio::test]
    async fn test_accumulates_totals() {
        let handler = AnalyticsHandler::new(Duration::ZERO);
        handler.handle(checkout("1", "ana", 40.0, 2)).await.unwrap();
        handler.handle(checkout("2", "ana", 20.0, 1)).await.unwrap();
        handler.handle(checkout("3", "bia", 30.0, 3)).await.unwrap();

        let snapshot = handler.snapshot();
        assert_eq!(snapshot.total_checkouts, 3);
        assert_eq!(snapshot.total_items, 6);
        assert!((snapshot.total_revenue - 90.0).abs() < 1e-9);
        assert!((snapshot.average_ticket - 30.0).abs() < 1e-9);
        assert_eq!(snapshot.unique_users, 2);

        let ana = &snapshot.top_users[0];
        assert_eq!(ana.user_id, "ana");
        assert_eq!(ana.checkouts, 2);
        assert!((ana.total_spent - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_top_users_limited_and_sorted() {
        let handler = AnalyticsHandler::new(Duration::ZERO);
        for (i, (user, amount)) in [("a", 10.0), ("b", 50.0), ("c", 30.0), ("d", 40.0)]
            .into_iter()
            .enumerate()
        {
            handler
                .handle(checkout(&i.to_string(), user, amount, 1))
                .await
                .unwrap();
        }

        let top: Vec<String> = handler
            .snapshot()
            .top_users
            .into_iter()
            .map(|u| u.user_id)
            .collect();
        assert_eq!(top, vec!["b", "d", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_delay() {
        let handler = AnalyticsHandler::default();
        let start = tokio::time::Instant::now();
        handler.handle(checkout("1", "ana", 1.0, 1)).await.unwrap();
        assert!(start.elapsed() >= DEFAULT_PROCESSING_DELAY);
    }

    #[tokio::test]
    async fn test_ignores_other_events() {
        let handler = AnalyticsHandler::new(Duration::ZERO);
        handler
            .handle(Arc::new(Envelope::now(DomainEvent::Unknown)))
            .await
            .unwrap();
        assert_eq!(handler.snapshot(), AnalyticsSnapshot::default());
    }
}

//! Event handlers run by the consumer binaries.
//!
//! - `notification`: checkout receipt delivery
//! - `analytics`: running checkout totals and top spenders
//! - `tasks`: mobile task sync
//! - `items`: item created/updated notifications from the fan-out topic
//!
//! Each handler owns its state and publishes read-only snapshots through a
//! `watch` channel. Events a handler is not interested in are skipped and
//! count as success.

pub mod analytics;
pub mod items;
pub mod notification;
pub mod tasks;

pub use analytics::{AnalyticsHandler, AnalyticsSnapshot, UserStats};
pub use items::{ItemNotificationHandler, ItemStats};
pub use notification::{NotificationHandler, ReceiptNotice};
pub use tasks::{TaskHandler, TaskStats};

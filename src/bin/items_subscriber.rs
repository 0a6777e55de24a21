//! items-subscriber: item notifications via SNS → SQS
//!
//! ## Architecture
//! ```text
//! [items-service] --(SNS items-notifications)--> [SQS items-notifications-queue]
//!                                                  |
//!                                             (long poll)
//!                                                  v
//!                                          [items-subscriber]
//! ```
//!
//! ## Configuration
//! - SNS_TOPIC_ARN: topic to relay (default: arn:aws:sns:us-east-1:000000000000:items-notifications)
//! - LOCALSTACK_ENDPOINT: custom SNS/SQS endpoint (optional)
//! - AWS_REGION: region (optional, default provider chain otherwise)
//! - SHOPPING_EVENTS__FANOUT__*: queue name and poll settings

use std::sync::Arc;

use tracing::info;

use shopping_events::bus::fanout::aws::{AwsFanoutClient, AwsFanoutConfig};
use shopping_events::config::Config;
use shopping_events::handlers::ItemNotificationHandler;
use shopping_events::services::run_relay_subscriber;
use shopping_events::utils::bootstrap::{init_tracing, shutdown_on_ctrl_c};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let client = AwsFanoutClient::connect(&AwsFanoutConfig {
        region: config.fanout.region.clone(),
        endpoint_url: config.fanout.endpoint_url.clone(),
    })
    .await;
    let handler = Arc::new(ItemNotificationHandler::new());

    info!("items-subscriber started");

    let stats = run_relay_subscriber(
        Arc::new(client),
        &config.fanout,
        handler.clone(),
        shutdown_on_ctrl_c(),
    )
    .await?;

    let items = handler.snapshot();
    info!(
        received = stats.received,
        deleted = stats.deleted,
        retained = stats.retained,
        created = items.created,
        updated = items.updated,
        "items-subscriber stopped"
    );
    Ok(())
}

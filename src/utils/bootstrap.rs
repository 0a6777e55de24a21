//! Bootstrap utilities for the consumer binaries.
//!
//! Shared initialization code: tracing setup and Ctrl-C wiring.

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::shutdown::{self, Shutdown};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "SHOPPING_EVENTS_LOG";

/// Initialize tracing with SHOPPING_EVENTS_LOG environment variable.
///
/// Defaults to "info" level if SHOPPING_EVENTS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Return a shutdown listener that fires on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> Shutdown {
    let (trigger, listener) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        trigger.trigger();
    });
    listener
}

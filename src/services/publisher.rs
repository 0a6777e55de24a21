//! Publisher process wiring: a supervised publisher for services that emit
//! checkout events.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::amqp::{ConnectionManager, Connector, Publisher};
use crate::bus::Result;
use crate::config::{AmqpConfig, PublisherConfig};
use crate::utils::shutdown::Shutdown;

/// A publisher kept attached by a background connection manager.
pub struct PublisherHandle {
    pub publisher: Arc<Publisher>,
    pub manager: Arc<ConnectionManager>,
    /// Ends on shutdown or a fatal error such as a conflicting exchange.
    pub task: JoinHandle<Result<()>>,
}

/// Spawn a publisher for `config.exchange` that re-attaches after every
/// reconnect. Publishing while disconnected fails with
/// `BusError::ChannelUnavailable`.
pub fn spawn_publisher(
    connector: Arc<dyn Connector>,
    amqp: &AmqpConfig,
    config: &PublisherConfig,
    shutdown: Shutdown,
) -> PublisherHandle {
    info!(
        endpoint = %connector.endpoint(),
        exchange = %config.exchange,
        "Starting publisher"
    );

    let manager = Arc::new(ConnectionManager::new(connector, amqp.reconnect_delay()));
    let publisher = Arc::new(Publisher::new(config.exchange.clone()));

    let task = {
        let manager = manager.clone();
        let publisher = publisher.clone();
        tokio::spawn(async move { manager.run(publisher.as_ref(), shutdown).await })
    };

    PublisherHandle {
        publisher,
        manager,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::amqp::InMemoryBroker;
    use crate::utils::shutdown;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publisher_attaches_and_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        let (trigger, listener) = shutdown::channel();
        let handle = spawn_publisher(
            Arc::new(broker.clone()),
            &AmqpConfig::default(),
            &PublisherConfig::default(),
            listener,
        );

        tokio::time::timeout(Duration::from_secs(5), handle.publisher.wait_ready())
            .await
            .expect("publisher did not attach");
        assert!(broker.exchange_exists("shopping_events"));

        trigger.trigger();
        handle.task.await.unwrap().unwrap();
        assert!(!handle.publisher.is_ready());
        assert_eq!(broker.open_connections(), 0);
    }
}

//! Broker connection lifecycle.
//!
//! [`ConnectionManager::run`] is a supervisor loop, not a recursive callback
//! chain. Each iteration opens one connection, hands it to a [`Session`] and
//! waits for whichever ends first:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closed  -> Disconnected (sleep, retry)
//!                     |                  \-> Errored -> stop (fatal session error)
//!                     \-> Errored -> Disconnected (sleep, retry)
//! ```
//!
//! The delay between attempts is constant (5000ms by default) and attempts
//! are unlimited. Error observers only log; a reconnect is driven by the
//! close observer or by the session returning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use super::{BrokerConnection, CloseReason, Connector};
use crate::bus::Result;
use crate::utils::retry;
use crate::utils::shutdown::Shutdown;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Errored,
}

/// Work bound to a single connection: declare topology, then publish or
/// consume until the connection drops or shutdown is requested.
#[async_trait]
pub trait Session: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Run against `connection`. Returning `Ok` after shutdown ends the
    /// supervisor; any other return schedules a reconnect unless the error
    /// is fatal.
    async fn run(&self, connection: Arc<dyn BrokerConnection>, shutdown: Shutdown) -> Result<()>;

    /// Called after the connection is gone, before the reconnect delay.
    async fn on_disconnected(&self) {}
}

/// Supervises one broker connection at a time.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
}

enum Outcome {
    Finished(Result<()>),
    Closed(CloseReason),
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            reconnect_delay,
            state: Arc::new(state),
        }
    }

    /// Manager with the default 5000ms reconnect delay.
    pub fn with_default_delay(connector: Arc<dyn Connector>) -> Self {
        Self::new(connector, retry::DEFAULT_RECONNECT_DELAY)
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    /// Make a single connection attempt.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.transition(ConnectionState::Connecting);
        let endpoint = self.connector.endpoint();

        match self.connector.connect().await {
            Ok(connection) => {
                let logged_endpoint = endpoint.clone();
                connection.on_error(Box::new(move |e| {
                    error!(endpoint = %logged_endpoint, error = %e, "Broker connection error");
                }));
                self.transition(ConnectionState::Connected);
                info!(endpoint = %endpoint, "Connected to broker");
                Ok(connection)
            }
            Err(e) => {
                self.transition(ConnectionState::Errored);
                Err(e)
            }
        }
    }

    /// Run `session` on successive connections until shutdown or a fatal
    /// session error.
    pub async fn run<S>(&self, session: &S, shutdown: Shutdown) -> Result<()>
    where
        S: Session + ?Sized,
    {
        let mut delays = retry::delays(
            retry::reconnect_backoff(self.reconnect_delay),
            self.reconnect_delay,
        );

        loop {
            if shutdown.is_triggered() {
                self.transition(ConnectionState::Disconnected);
                return Ok(());
            }

            let connection = match self.connect().await {
                Ok(connection) => connection,
                Err(e) => {
                    let delay = delays.next().unwrap_or(self.reconnect_delay);
                    warn!(
                        session = session.name(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection failed, retrying"
                    );
                    self.transition(ConnectionState::Disconnected);
                    if Self::sleep_or_shutdown(delay, shutdown.clone()).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let (closed_tx, closed_rx) = oneshot::channel();
            let state = self.state.clone();
            connection.on_closed(Box::new(move |reason| {
                state.send_replace(ConnectionState::Closed);
                let _ = closed_tx.send(reason);
            }));

            let outcome = tokio::select! {
                result = session.run(connection.clone(), shutdown.clone()) => Outcome::Finished(result),
                reason = closed_rx => Outcome::Closed(
                    reason.unwrap_or_else(|_| CloseReason::Lost("close observer dropped".to_string())),
                ),
            };

            match outcome {
                Outcome::Finished(Ok(())) if shutdown.is_triggered() => {
                    if let Err(e) = connection.close().await {
                        warn!(session = session.name(), error = %e, "Error closing connection");
                    }
                    self.transition(ConnectionState::Closed);
                    info!(session = session.name(), "Connection closed on shutdown");
                    self.transition(ConnectionState::Disconnected);
                    return Ok(());
                }
                Outcome::Finished(Ok(())) => {
                    warn!(session = session.name(), "Session ended unexpectedly");
                    let _ = connection.close().await;
                    self.transition(ConnectionState::Closed);
                }
                Outcome::Finished(Err(e)) if e.is_fatal() => {
                    error!(session = session.name(), error = %e, "Fatal session error, giving up");
                    let _ = connection.close().await;
                    self.transition(ConnectionState::Errored);
                    return Err(e);
                }
                Outcome::Finished(Err(e)) => {
                    warn!(session = session.name(), error = %e, "Session failed");
                    let _ = connection.close().await;
                    self.transition(ConnectionState::Errored);
                }
                Outcome::Closed(reason) => {
                    warn!(session = session.name(), reason = %reason, "Broker connection closed");
                    self.transition(ConnectionState::Closed);
                }
            }

            session.on_disconnected().await;
            self.transition(ConnectionState::Disconnected);

            let delay = delays.next().unwrap_or(self.reconnect_delay);
            info!(
                session = session.name(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after delay"
            );
            if Self::sleep_or_shutdown(delay, shutdown.clone()).await {
                return Ok(());
            }
        }
    }

    /// Sleep for `delay`; `true` when shutdown fired first.
    async fn sleep_or_shutdown(delay: Duration, mut shutdown: Shutdown) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.wait() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::amqp::InMemoryBroker;
    use crate::bus::BusError;
    use crate::utils::shutdown;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Session that counts runs and parks until shutdown.
    struct ParkingSession {
        runs: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl ParkingSession {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Session for ParkingSession {
        fn name(&self) -> &str {
            "parking"
        }

        async fn run(&self, _connection: Arc<dyn BrokerConnection>, mut shutdown: Shutdown) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            shutdown.wait().await;
            Ok(())
        }

        async fn on_disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FatalSession;

    #[async_trait]
    impl Session for FatalSession {
        fn name(&self) -> &str {
            "fatal"
        }

        async fn run(&self, _connection: Arc<dyn BrokerConnection>, _shutdown: Shutdown) -> Result<()> {
            Err(BusError::TopologyConflict {
                kind: "exchange",
                name: "events".to_string(),
                message: "exists with durable=false".to_string(),
            })
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_close_with_constant_delay() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(ConnectionManager::with_default_delay(Arc::new(broker.clone())));
        let session = Arc::new(ParkingSession::new());
        let (trigger, listener) = shutdown::channel();

        let task = {
            let manager = manager.clone();
            let session = session.clone();
            tokio::spawn(async move { manager.run(session.as_ref(), listener).await })
        };
        settle().await;
        assert_eq!(session.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.current_state(), ConnectionState::Connected);

        broker.drop_connections();
        assert_eq!(manager.current_state(), ConnectionState::Closed);
        settle().await;
        assert_eq!(session.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);

        tokio::time::advance(Duration::from_millis(4999)).await;
        settle().await;
        assert_eq!(broker.connect_attempts(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(session.runs.load(Ordering::SeqCst), 2);

        trigger.trigger();
        task.await.unwrap().unwrap();
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_unreachable_broker_without_limit() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            Duration::from_millis(5000),
        ));
        let session = Arc::new(ParkingSession::new());
        let (trigger, listener) = shutdown::channel();

        let task = {
            let manager = manager.clone();
            let session = session.clone();
            tokio::spawn(async move { manager.run(session.as_ref(), listener).await })
        };

        for _ in 0..20 {
            settle().await;
            tokio::time::advance(Duration::from_millis(5000)).await;
        }
        settle().await;
        assert!(broker.connect_attempts() >= 20);
        assert_eq!(session.runs.load(Ordering::SeqCst), 0);

        broker.set_reachable(true);
        tokio::time::advance(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(session.runs.load(Ordering::SeqCst), 1);

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_session_error_stops_supervisor() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::with_default_delay(Arc::new(broker.clone()));
        let (_trigger, listener) = shutdown::channel();

        let err = manager.run(&FatalSession, listener).await.unwrap_err();
        assert!(matches!(err, BusError::TopologyConflict { .. }));
        assert_eq!(manager.current_state(), ConnectionState::Errored);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_never_connects() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::with_default_delay(Arc::new(broker.clone()));
        let (trigger, listener) = shutdown::channel();
        trigger.trigger();

        manager.run(&ParkingSession::new(), listener).await.unwrap();
        assert_eq!(broker.connect_attempts(), 0);
    }
}

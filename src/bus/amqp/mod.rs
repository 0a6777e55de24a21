//! Topic-routed broker (AMQP) support.
//!
//! The broker is reached through three object-safe traits so the connection
//! manager, publisher and consumer loop run unchanged against RabbitMQ
//! (`rabbitmq`, feature `amqp`) or the in-memory broker (`memory`):
//!
//! - [`Connector`]: opens a fresh [`BrokerConnection`] per attempt
//! - [`BrokerConnection`]: one exclusive connection with close/error observers
//! - [`BrokerChannel`]: declarations, prefetch, publish and consume
//!
//! Deliveries carry their own acker; [`Delivery::ack`] and [`Delivery::nack`]
//! consume the delivery so each one gets exactly one outcome.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{BusError, Result};

pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
#[cfg(feature = "amqp")]
pub mod rabbitmq;
pub mod topology;

pub use connection::{ConnectionManager, ConnectionState, Session};
pub use consumer::{ConsumerConfig, ConsumerStats, QueueConsumer, RedeliveryPolicy};
pub use memory::InMemoryBroker;
pub use publisher::Publisher;
#[cfg(feature = "amqp")]
pub use rabbitmq::RabbitMqConnector;
pub use topology::QueueBinding;

/// Header carrying the number of times a message has been republished after
/// handler failure under a bounded redelivery policy.
pub const REDELIVERY_COUNT_HEADER: &str = "x-redelivery-count";

/// Content type set on every published envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Parameters of a topic exchange declaration. Routing keys are
/// dot-delimited and matched against `*`/`#` binding patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicOptions {
    pub durable: bool,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// Parameters of a queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// Message metadata carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Survives a broker restart when queued on a durable queue.
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Value of the `x-redelivery-count` header, 0 when absent.
    pub redelivery_count: u32,
}

impl MessageProperties {
    /// Persistent JSON message with the given id.
    pub fn persistent_json(message_id: impl Into<String>) -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            persistent: true,
            message_id: Some(message_id.into()),
            redelivery_count: 0,
        }
    }

    /// Copy of these properties with the redelivery counter set.
    pub fn with_redelivery_count(&self, count: u32) -> Self {
        Self {
            redelivery_count: count,
            ..self.clone()
        }
    }
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request by this process.
    Graceful,
    /// Lost to a network failure or closed by the broker.
    Lost(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Graceful => write!(f, "closed gracefully"),
            CloseReason::Lost(reason) => write!(f, "lost: {}", reason),
        }
    }
}

/// Callback invoked once when a connection closes.
pub type CloseHandler = Box<dyn FnOnce(CloseReason) + Send>;

/// Callback invoked on every connection-level error.
pub type ErrorHandler = Box<dyn Fn(&BusError) + Send + Sync>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;

    /// Endpoint description for logs. Must not contain credentials.
    fn endpoint(&self) -> String;
}

/// One exclusive broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Register a close observer. Fires immediately if already closed.
    fn on_closed(&self, handler: CloseHandler);

    /// Register an error observer. Observers only log; they never reconnect.
    fn on_error(&self, handler: ErrorHandler);

    fn is_open(&self) -> bool;

    /// Close gracefully. Un-acked deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_topic(&self, name: &str, options: TopicOptions) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, topic: &str, pattern: &str) -> Result<()>;

    /// Limit un-acked deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>>;

    /// Publish to `topic`. The empty topic name is the default exchange,
    /// which routes directly to the queue named by `routing_key`.
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Stream of deliveries for one consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the channel or connection is gone.
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer and not yet settled.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub routing_key: String,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
    pub properties: MessageProperties,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: MessageProperties,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            payload,
            routing_key: routing_key.into(),
            redelivered,
            properties,
            acker,
        }
    }

    /// Remove the message from its queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message, returning it to the queue when `requeue` is set.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Close and error observer registry shared by connection implementations.
#[derive(Default)]
pub struct ConnectionObservers {
    inner: Mutex<ObserverState>,
}

#[derive(Default)]
struct ObserverState {
    closed: Option<CloseReason>,
    close_handlers: Vec<CloseHandler>,
    error_handlers: Vec<Arc<dyn Fn(&BusError) + Send + Sync>>,
}

impl ConnectionObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_closed(&self, handler: CloseHandler) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match state.closed.clone() {
            Some(reason) => {
                drop(state);
                handler(reason);
            }
            None => state.close_handlers.push(handler),
        }
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.error_handlers.push(Arc::from(handler));
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
            .is_some()
    }

    /// Record the close and fire close observers. Later calls are ignored.
    pub fn notify_closed(&self, reason: CloseReason) {
        let handlers = {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            std::mem::take(&mut state.close_handlers)
        };
        for handler in handlers {
            handler(reason.clone());
        }
    }

    pub fn notify_error(&self, error: &BusError) {
        let handlers = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error_handlers
            .clone();
        for handler in handlers {
            handler(error);
        }
    }
}

//! Event bus for durable delivery.
//!
//! This module contains:
//! - `BusError` / `HandlerError`: error taxonomy shared by every backend
//! - `EventHandler` trait: business logic invoked once per delivery
//! - `envelope`: the tagged event envelope carried on the wire
//! - `routing`: topic-exchange routing-key matching
//! - `amqp`: connection manager, topology, publisher and consumer loop
//! - `fanout`: SNS→SQS relay setup and the long-poll consume loop

use std::sync::Arc;

use futures::future::BoxFuture;

pub mod amqp;
pub mod envelope;
pub mod fanout;
pub mod routing;

pub use envelope::{
    CheckoutCompleted, DomainEvent, Envelope, Item, ItemNotification, Task, TaskOperation,
    TaskSync,
};
pub use fanout::FanoutError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Transport-level failure. Recovered by the reconnect loop.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// An exchange or queue already exists with different parameters.
    #[error("Topology conflict on {kind} '{name}': {message}")]
    TopologyConflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// Declaration or binding failed for a reason other than a conflict.
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    /// Publish attempted while no channel is established.
    #[error("No channel available for publishing")]
    ChannelUnavailable,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// Fan-out relay could not be provisioned. Fatal for the fan-out path.
    #[error("Relay setup failed while trying to {step}")]
    RelaySetup {
        step: &'static str,
        #[source]
        source: FanoutError,
    },

    #[error("Fan-out operation failed: {0}")]
    Fanout(#[from] FanoutError),
}

impl BusError {
    /// Whether the reconnect loop should give up instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::TopologyConflict { .. } | BusError::RelaySetup { .. }
        )
    }
}

/// Failure raised by an event handler.
///
/// Any handler failure leaves the message on its queue: queue consumers nack
/// with requeue, the poll loop skips the delete.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Downstream call failed: {0}")]
    Downstream(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Handler for processing events delivered from a queue.
pub trait EventHandler: Send + Sync {
    /// Process one envelope. `Ok` acknowledges the delivery, `Err` returns it
    /// to the queue.
    fn handle(
        &self,
        envelope: Arc<Envelope>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Result of publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Hex SHA-256 of the serialized payload, also sent as the message id.
    pub message_id: String,
    /// Routing key (AMQP) or topic ARN (fan-out) the message was sent to.
    pub destination: String,
    /// Size of the serialized payload in bytes.
    pub payload_len: usize,
}

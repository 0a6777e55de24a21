//! Process wiring for the consumer binaries and for publishing services.
//!
//! Each function runs one long-lived loop until its [`Shutdown`] fires and
//! returns the final counters. Backends are passed in so the same wiring runs
//! against RabbitMQ/AWS or the in-memory implementations.
//!
//! [`Shutdown`]: crate::utils::shutdown::Shutdown

pub mod consumer;
pub mod publisher;
pub mod relay;

pub use consumer::run_queue_consumer;
pub use publisher::{spawn_publisher, PublisherHandle};
pub use relay::run_relay_subscriber;

//! Shopping Events - durable event distribution
//!
//! Delivers shopping-service events to independent consumers:
//! topic-routed AMQP queues with acknowledgement and reconnect, and an
//! SNS topic relayed into a long-polled SQS queue.

pub mod bus;
pub mod config;
pub mod handlers;
pub mod services;
pub mod utils;

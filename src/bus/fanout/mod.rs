//! Pub/sub fan-out path: topic -> subscription -> relay queue -> poll loop.
//!
//! This module contains:
//! - `FanoutClient` trait: the topic and queue operations the relay needs
//! - `relay`: idempotent topic/queue/subscription/policy setup
//! - `poll`: long-poll consume loop with delete-after-success
//! - `publisher`: publishes envelopes to the topic
//! - `memory`: in-memory topic/queue service with visibility timeouts
//! - `aws`: SNS/SQS client (feature `sns-sqs`)

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(feature = "sns-sqs")]
pub mod aws;
pub mod memory;
pub mod poll;
pub mod publisher;
pub mod relay;

#[cfg(feature = "sns-sqs")]
pub use aws::AwsFanoutClient;
pub use memory::InMemoryFanout;
pub use poll::{PollLoop, PollSettings, PollState, PollStats};
pub use publisher::FanoutPublisher;
pub use relay::{setup_relay, RelayQueue};

/// Subscription protocol that delivers into a queue.
pub const QUEUE_PROTOCOL: &str = "sqs";

/// Errors from topic/queue service calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Queue already exists: {0}")]
    QueueAlreadyExists(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// A message received from a queue. `receipt_handle` is valid only for this
/// delivery; a later receive of the same message issues a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// A topic subscription as listed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub subscription_arn: String,
    pub protocol: String,
    pub endpoint: String,
}

/// Topic and queue operations used by the relay, publisher and poll loop.
#[async_trait]
pub trait FanoutClient: Send + Sync {
    /// `Err(NotFound)` when the topic does not exist.
    async fn topic_exists(&self, topic_arn: &str) -> Result<(), FanoutError>;

    /// Create a topic by name and return its ARN. Idempotent.
    async fn create_topic(&self, name: &str) -> Result<String, FanoutError>;

    /// Create a queue and return its URL. May fail with `QueueAlreadyExists`.
    async fn create_queue(&self, name: &str) -> Result<String, FanoutError>;

    /// Resolve an existing queue's URL.
    async fn queue_url(&self, name: &str) -> Result<String, FanoutError>;

    async fn queue_arn(&self, queue_url: &str) -> Result<String, FanoutError>;

    async fn list_subscriptions(&self, topic_arn: &str)
        -> Result<Vec<SubscriptionInfo>, FanoutError>;

    /// Subscribe `endpoint` to the topic and return the subscription ARN.
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, FanoutError>;

    /// Replace the queue's access policy document.
    async fn set_queue_policy(&self, queue_url: &str, policy: &str) -> Result<(), FanoutError>;

    /// Publish to a topic and return the message id.
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<String, FanoutError>;

    /// Long-poll for up to `max_messages`, waiting up to `wait_time_secs`.
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>, FanoutError>;

    /// Delete a message by receipt handle.
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), FanoutError>;
}

/// Topic name and ARN parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRef {
    pub arn: String,
    pub name: String,
}

impl TopicRef {
    /// Split `arn:aws:sns:<region>:<account>:<name>`.
    pub fn from_arn(arn: &str) -> Result<Self, FanoutError> {
        let parts: Vec<&str> = arn.split(':').collect();
        match parts.as_slice() {
            ["arn", _, "sns", _, _, name] if !name.is_empty() => Ok(Self {
                arn: arn.to_string(),
                name: (*name).to_string(),
            }),
            _ => Err(FanoutError::InvalidMessage(format!(
                "not a topic ARN: {}",
                arn
            ))),
        }
    }
}

/// Queue access policy allowing exactly one topic to enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Principal")]
    pub principal: HashMap<String, String>,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Resource")]
    pub resource: String,
    #[serde(rename = "Condition")]
    pub condition: HashMap<String, HashMap<String, String>>,
}

const POLICY_VERSION: &str = "2012-10-17";
const SEND_MESSAGE_ACTION: &str = "sqs:SendMessage";
const SOURCE_ARN_KEY: &str = "aws:SourceArn";
const ARN_EQUALS: &str = "ArnEquals";

impl QueuePolicy {
    pub fn allow_topic(queue_arn: &str, topic_arn: &str) -> Self {
        let principal = HashMap::from([("Service".to_string(), "sns.amazonaws.com".to_string())]);
        let condition = HashMap::from([(
            ARN_EQUALS.to_string(),
            HashMap::from([(SOURCE_ARN_KEY.to_string(), topic_arn.to_string())]),
        )]);
        Self {
            version: POLICY_VERSION.to_string(),
            statement: vec![PolicyStatement {
                effect: "Allow".to_string(),
                principal,
                action: SEND_MESSAGE_ACTION.to_string(),
                resource: queue_arn.to_string(),
                condition,
            }],
        }
    }

    pub fn to_json(&self) -> Result<String, FanoutError> {
        serde_json::to_string(self).map_err(|e| FanoutError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, FanoutError> {
        serde_json::from_str(json).map_err(|e| FanoutError::InvalidMessage(e.to_string()))
    }

    /// Whether `topic_arn` may send into `queue_arn` under this policy.
    pub fn allows(&self, queue_arn: &str, topic_arn: &str) -> bool {
        self.statement.iter().any(|s| {
            s.effect == "Allow"
                && s.action == SEND_MESSAGE_ACTION
                && s.resource == queue_arn
                && s.condition
                    .get(ARN_EQUALS)
                    .and_then(|c| c.get(SOURCE_ARN_KEY))
                    .is_some_and(|arn| arn == topic_arn)
        })
    }
}

/// Outer envelope a topic wraps around every message delivered to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Subject", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// The published message, still serialized.
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

impl Notification {
    pub fn from_body(body: &str) -> Result<Self, FanoutError> {
        serde_json::from_str(body)
            .map_err(|e| FanoutError::InvalidMessage(format!("not a notification: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "arn:aws:sns:us-east-1:000000000000:items-notifications";
    const QUEUE: &str = "arn:aws:sqs:us-east-1:000000000000:items-notifications-queue";

    #[test]
    fn test_topic_ref_from_arn() {
        let topic = TopicRef::from_arn(TOPIC).unwrap();
        assert_eq!(topic.name, "items-notifications");
        assert!(TopicRef::from_arn("items-notifications").is_err());
        assert!(TopicRef::from_arn("arn:aws:sqs:us-east-1:0:q").is_err());
    }

    #[test]
    fn test_policy_allows_only_its_topic() {
        let policy = QueuePolicy::allow_topic(QUEUE, TOPIC);
        assert!(policy.allows(QUEUE, TOPIC));
        assert!(!policy.allows(QUEUE, "arn:aws:sns:us-east-1:000000000000:other"));
        assert!(!policy.allows("arn:aws:sqs:us-east-1:000000000000:other-queue", TOPIC));
    }

    #[test]
    fn test_policy_document_shape() {
        let json = QueuePolicy::allow_topic(QUEUE, TOPIC).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["Version"], "2012-10-17");
        assert_eq!(value["Statement"][0]["Action"], "sqs:SendMessage");
        assert_eq!(value["Statement"][0]["Condition"]["ArnEquals"]["aws:SourceArn"], TOPIC);
        assert_eq!(QueuePolicy::from_json(&json).unwrap(), QueuePolicy::allow_topic(QUEUE, TOPIC));
    }

    #[test]
    fn test_notification_unwrap() {
        let body = r#"{"Type":"Notification","MessageId":"m-1","TopicArn":"arn:aws:sns:us-east-1:000000000000:items-notifications","Subject":"New item","Message":"{\"eventType\":\"ITEM_CREATED\"}","Timestamp":"2024-05-01T12:00:00.000Z"}"#;
        let notification = Notification::from_body(body).unwrap();
        assert_eq!(notification.subject.as_deref(), Some("New item"));
        assert_eq!(notification.message, r#"{"eventType":"ITEM_CREATED"}"#);
        assert!(Notification::from_body("{}").is_err());
    }
}

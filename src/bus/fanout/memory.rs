//! In-memory topic/queue service.
//!
//! Behaves like SNS in front of SQS for the operations the relay and poll
//! loop use:
//! - topic publish wraps the message in a [`Notification`] and enqueues it
//!   into every `sqs` subscriber whose policy admits the topic
//! - receive long-polls, hides returned messages for the visibility timeout
//!   and issues a fresh receipt handle per delivery
//! - delete with a stale receipt handle is a silent no-op
//! - `create_queue` on an existing name fails with `QueueAlreadyExists`
//!
//! ARNs use account `000000000000` in `us-east-1`; queue URLs follow the
//! LocalStack layout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{
    FanoutClient, FanoutError, Notification, QueuePolicy, ReceivedMessage, SubscriptionInfo,
    QUEUE_PROTOCOL,
};

const REGION: &str = "us-east-1";
const ACCOUNT: &str = "000000000000";
const ENDPOINT: &str = "http://localhost:4566";

/// Default time a received message stays hidden.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handle to an in-memory topic/queue service.
#[derive(Clone)]
pub struct InMemoryFanout {
    state: Arc<Mutex<FanoutState>>,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct FanoutState {
    unavailable: bool,
    topics: HashMap<String, Vec<SubscriptionInfo>>,
    queues: HashMap<String, QueueState>,
}

struct QueueState {
    url: String,
    arn: String,
    policy: Option<QueuePolicy>,
    messages: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

struct StoredMessage {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

fn topic_arn(name: &str) -> String {
    format!("arn:aws:sns:{}:{}:{}", REGION, ACCOUNT, name)
}

fn queue_arn(name: &str) -> String {
    format!("arn:aws:sqs:{}:{}:{}", REGION, ACCOUNT, name)
}

fn queue_url(name: &str) -> String {
    format!("{}/{}/{}", ENDPOINT, ACCOUNT, name)
}

fn queue_name_from_url(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

impl FanoutState {
    fn check_available(&self) -> Result<(), FanoutError> {
        if self.unavailable {
            Err(FanoutError::Transport("service unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn queue_mut(&mut self, url: &str) -> Result<&mut QueueState, FanoutError> {
        self.queues
            .get_mut(queue_name_from_url(url))
            .filter(|q| q.url == url)
            .ok_or_else(|| FanoutError::NotFound(url.to_string()))
    }

    fn topic(&self, arn: &str) -> Result<&Vec<SubscriptionInfo>, FanoutError> {
        self.topics
            .get(arn)
            .ok_or_else(|| FanoutError::NotFound(arn.to_string()))
    }
}

impl Default for InMemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFanout {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(FanoutState::default())),
            visibility_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FanoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Messages stored in the queue, visible or in flight.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.messages.len())
    }

    pub fn subscription_count(&self, topic_arn: &str) -> usize {
        self.lock().topics.get(topic_arn).map_or(0, Vec::len)
    }

    /// Whether a policy has been installed on the named queue.
    pub fn has_policy(&self, name: &str) -> bool {
        self.lock()
            .queues
            .get(name)
            .is_some_and(|q| q.policy.is_some())
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Enqueue a raw body directly, bypassing the topic.
    pub fn send_raw(&self, queue_url: &str, body: impl Into<String>) -> Result<String, FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        let queue = state.queue_mut(queue_url)?;
        let message_id = Uuid::new_v4().to_string();
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            visible_at: Instant::now(),
            receipt_handle: None,
        });
        queue.notify.notify_waiters();
        Ok(message_id)
    }

    /// Take visible messages, hiding them and issuing new receipts.
    fn take_visible(&self, queue_url: &str, max: usize) -> Result<(Vec<ReceivedMessage>, Option<Instant>), FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        let visibility_timeout = self.visibility_timeout;
        let queue = state.queue_mut(queue_url)?;
        let now = Instant::now();

        let mut received = Vec::new();
        for message in queue.messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if message.visible_at <= now {
                let receipt = Uuid::new_v4().to_string();
                message.receipt_handle = Some(receipt.clone());
                message.visible_at = now + visibility_timeout;
                received.push(ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle: receipt,
                    body: message.body.clone(),
                });
            }
        }

        let next_visible = queue.messages.iter().map(|m| m.visible_at).min();
        Ok((received, next_visible))
    }

    fn queue_notify(&self, queue_url: &str) -> Result<Arc<Notify>, FanoutError> {
        let mut state = self.lock();
        Ok(state.queue_mut(queue_url)?.notify.clone())
    }
}

#[async_trait]
impl FanoutClient for InMemoryFanout {
    async fn topic_exists(&self, topic_arn: &str) -> Result<(), FanoutError> {
        let state = self.lock();
        state.check_available()?;
        state.topic(topic_arn).map(|_| ())
    }

    async fn create_topic(&self, name: &str) -> Result<String, FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        let arn = topic_arn(name);
        state.topics.entry(arn.clone()).or_default();
        Ok(arn)
    }

    async fn create_queue(&self, name: &str) -> Result<String, FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        if state.queues.contains_key(name) {
            return Err(FanoutError::QueueAlreadyExists(name.to_string()));
        }
        let url = queue_url(name);
        state.queues.insert(
            name.to_string(),
            QueueState {
                url: url.clone(),
                arn: queue_arn(name),
                policy: None,
                messages: Vec::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(url)
    }

    async fn queue_url(&self, name: &str) -> Result<String, FanoutError> {
        let state = self.lock();
        state.check_available()?;
        state
            .queues
            .get(name)
            .map(|q| q.url.clone())
            .ok_or_else(|| FanoutError::NotFound(name.to_string()))
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String, FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state.queue_mut(queue_url)?.arn.clone())
    }

    async fn list_subscriptions(
        &self,
        topic_arn: &str,
    ) -> Result<Vec<SubscriptionInfo>, FanoutError> {
        let state = self.lock();
        state.check_available()?;
        state.topic(topic_arn).cloned()
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        let subscriptions = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| FanoutError::NotFound(topic_arn.to_string()))?;

        if let Some(existing) = subscriptions
            .iter()
            .find(|s| s.protocol == protocol && s.endpoint == endpoint)
        {
            return Ok(existing.subscription_arn.clone());
        }

        let arn = format!("{}:{}", topic_arn, Uuid::new_v4());
        subscriptions.push(SubscriptionInfo {
            subscription_arn: arn.clone(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(arn)
    }

    async fn set_queue_policy(&self, queue_url: &str, policy: &str) -> Result<(), FanoutError> {
        let policy = QueuePolicy::from_json(policy)?;
        let mut state = self.lock();
        state.check_available()?;
        state.queue_mut(queue_url)?.policy = Some(policy);
        Ok(())
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<String, FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        let endpoints: Vec<String> = state
            .topic(topic_arn)?
            .iter()
            .filter(|s| s.protocol == QUEUE_PROTOCOL)
            .map(|s| s.endpoint.clone())
            .collect();

        let message_id = Uuid::new_v4().to_string();
        let notification = Notification {
            kind: "Notification".to_string(),
            message_id: message_id.clone(),
            topic_arn: topic_arn.to_string(),
            subject: subject.map(str::to_string),
            message: message.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let body = serde_json::to_string(&notification)
            .map_err(|e| FanoutError::InvalidMessage(e.to_string()))?;

        for queue in state.queues.values_mut() {
            if !endpoints.contains(&queue.arn) {
                continue;
            }
            let allowed = queue
                .policy
                .as_ref()
                .is_some_and(|p| p.allows(&queue.arn, topic_arn));
            if !allowed {
                debug!(queue_arn = %queue.arn, topic_arn = %topic_arn, "Delivery denied by queue policy");
                continue;
            }
            queue.messages.push(StoredMessage {
                message_id: Uuid::new_v4().to_string(),
                body: body.clone(),
                visible_at: Instant::now(),
                receipt_handle: None,
            });
            queue.notify.notify_waiters();
        }

        Ok(message_id)
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>, FanoutError> {
        let max = usize::try_from(max_messages.clamp(1, 10)).unwrap_or(1);
        let wait = Duration::from_secs(u64::try_from(wait_time_secs.max(0)).unwrap_or(0));
        let deadline = Instant::now() + wait;
        let notify = self.queue_notify(queue_url)?;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (received, next_visible) = self.take_visible(queue_url, max)?;
            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }

            let wake_at = next_visible
                .filter(|at| *at < deadline)
                .unwrap_or(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), FanoutError> {
        let mut state = self.lock();
        state.check_available()?;
        let queue = state.queue_mut(queue_url)?;
        let before = queue.messages.len();
        queue
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if queue.messages.len() == before {
            debug!(queue_url = %queue_url, "Delete with stale receipt handle ignored");
        }
        Ok(())
    }
}

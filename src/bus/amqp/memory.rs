//! In-memory topic broker.
//!
//! Implements the broker traits with RabbitMQ's observable semantics so the
//! connection manager, publisher and consumer loop can be exercised without a
//! server:
//! - topic/direct/fanout exchanges, one copy per matching queue
//! - default exchange (`""`) routing straight to the named queue
//! - per-consumer prefetch, ack, nack with or without requeue
//! - un-acked deliveries return to the head of their queue when the owning
//!   channel or connection closes
//! - declarations with different parameters fail with a topology conflict
//!   and close the channel
//! - `restart()` keeps durable exchanges, durable queues and their persistent
//!   messages
//!
//! Fault injection: [`InMemoryBroker::drop_connections`],
//! [`InMemoryBroker::set_reachable`], [`InMemoryBroker::restart`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnection, CloseHandler, CloseReason, ConnectionObservers, Connector,
    Delivery, DeliveryAcker, DeliveryStream, ErrorHandler, MessageProperties, QueueOptions,
    TopicOptions,
};
use crate::bus::routing::{pattern_matches, validate_pattern};
use crate::bus::{BusError, Result};

/// Shared handle to an in-memory broker. Clones address the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicUsize,
}

struct BrokerState {
    reachable: bool,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, Arc<ConnectionObservers>>,
    /// Open channel id -> owning connection id.
    channels: HashMap<u64, u64>,
    next_id: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            next_id: 1,
        }
    }
}

struct Exchange {
    options: TopicOptions,
    bindings: Vec<Binding>,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

struct Queue {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    routing_key: String,
    properties: MessageProperties,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    connection: u64,
    channel: u64,
    consumer: u64,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_channel(&self, channel: u64) -> Result<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BusError::Connection("channel is closed".to_string()))
        }
    }

    /// Return matching un-acked deliveries to the head of their queues,
    /// preserving their original order.
    fn requeue_unacked(&mut self, owned: impl Fn(&Unacked) -> bool) {
        for queue in self.queues.values_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| owned(u))
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            queue.notify.notify_waiters();
        }
    }

    fn close_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_some() {
            self.requeue_unacked(|u| u.channel == channel);
        }
    }

    /// Tear down a connection. The returned observers must be notified after
    /// the state lock is released.
    fn close_connection(&mut self, connection: u64) -> Option<Arc<ConnectionObservers>> {
        let observers = self.connections.remove(&connection)?;
        self.channels.retain(|_, owner| *owner != connection);
        self.requeue_unacked(|u| u.connection == connection);
        Some(observers)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let exchange_state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::Publish(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &exchange_state.bindings {
            if pattern_matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent connection attempts succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Simulate a network failure on every open connection.
    pub fn drop_connections(&self) {
        let closed: Vec<Arc<ConnectionObservers>> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.close_connection(id))
                .collect()
        };
        debug!(connections = closed.len(), "Dropping in-memory connections");
        for observers in closed {
            observers.notify_closed(CloseReason::Lost("connection reset by peer".to_string()));
        }
    }

    /// Simulate a broker restart: connections drop, transient exchanges and
    /// queues vanish, durable queues keep only persistent messages.
    pub fn restart(&self) {
        let closed: Vec<Arc<ConnectionObservers>> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let closed = ids
                .into_iter()
                .filter_map(|id| state.close_connection(id))
                .collect();

            state.exchanges.retain(|_, e| e.options.durable);
            state.queues.retain(|_, q| q.options.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|m| m.properties.persistent);
            }
            let queues: HashSet<String> = state.queues.keys().cloned().collect();
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|b| queues.contains(&b.queue));
            }
            closed
        };
        debug!("In-memory broker restarted");
        for observers in closed {
            observers.notify_closed(CloseReason::Lost("broker restarted".to_string()));
        }
    }

    /// Number of `connect()` calls made so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting for delivery.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.unacked.len())
    }

    pub fn binding_count(&self, exchange: &str) -> usize {
        self.lock()
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }

    fn close_connection(&self, connection: u64, reason: CloseReason) {
        let observers = self.lock().close_connection(connection);
        if let Some(observers) = observers {
            observers.notify_closed(reason);
        }
    }

    fn settle(&self, queue: &str, tag: u64, connection: u64, outcome: Settle) -> Result<()> {
        let mut state = self.lock();
        if !state.connections.contains_key(&connection) {
            return Err(BusError::Connection(
                "delivery belongs to a closed connection".to_string(),
            ));
        }
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Connection(format!("queue '{}' no longer exists", queue)))?;
        let unacked = queue_state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BusError::Connection(format!("unknown delivery tag {}", tag)))?;

        if outcome == Settle::Requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            queue_state.ready.push_front(message);
        }
        queue_state.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        if !state.reachable {
            return Err(BusError::Connection(
                "in-memory broker is unreachable".to_string(),
            ));
        }
        let id = state.allocate_id();
        let observers = Arc::new(ConnectionObservers::new());
        state.connections.insert(id, observers.clone());
        debug!(connection = id, "In-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            observers,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://broker".to_string()
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    observers: Arc<ConnectionObservers>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BusError::Connection("connection is closed".to_string()));
        }
        let id = state.allocate_id();
        state.channels.insert(id, self.id);
        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            broker: self.broker.clone(),
            prefetch: AtomicU16::new(0),
        }))
    }

    fn on_closed(&self, handler: CloseHandler) {
        self.observers.on_closed(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.observers.on_error(handler);
    }

    fn is_open(&self) -> bool {
        !self.observers.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_connection(self.id, CloseReason::Graceful);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: InMemoryBroker,
    /// Prefetch applied to consumers started after it is set; 0 is unlimited.
    prefetch: AtomicU16,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topic(&self, name: &str, options: TopicOptions) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;

        if let Some(existing) = state.exchanges.get(name) {
            if existing.options != options {
                let message = format!(
                    "exists with durable={}, requested durable={}",
                    existing.options.durable, options.durable
                );
                state.close_channel(self.id);
                return Err(BusError::TopologyConflict {
                    kind: "exchange",
                    name: name.to_string(),
                    message,
                });
            }
            return Ok(());
        }

        state.exchanges.insert(
            name.to_string(),
            Exchange {
                options,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;

        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                let message = format!(
                    "exists with durable={}, requested durable={}",
                    existing.options.durable, options.durable
                );
                state.close_channel(self.id);
                return Err(BusError::TopologyConflict {
                    kind: "queue",
                    name: name.to_string(),
                    message,
                });
            }
            return Ok(());
        }

        state.queues.insert(
            name.to_string(),
            Queue {
                options,
                ready: VecDeque::new(),
                unacked: BTreeMap::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, topic: &str, pattern: &str) -> Result<()> {
        validate_pattern(pattern)?;
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("no queue '{}'", queue)));
        }
        let exchange = state
            .exchanges
            .get_mut(topic)
            .ok_or_else(|| BusError::Topology(format!("no exchange '{}'", topic)))?;

        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.broker.lock().ensure_channel(self.id)?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;

        let notify = state
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| BusError::Topology(format!("no queue '{}'", queue)))?;
        let consumer = state.allocate_id();
        debug!(queue = %queue, consumer_tag = %consumer_tag, "In-memory consumer started");

        Ok(Box::new(MemoryStream {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            connection: self.connection,
            channel: self.id,
            consumer,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            notify,
        }))
    }

    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;

        let targets = state.route(topic, routing_key)?;
        if targets.is_empty() {
            debug!(exchange = %topic, routing_key = %routing_key, "Message unroutable, dropped");
            return Ok(());
        }

        let message = StoredMessage {
            payload,
            routing_key: routing_key.to_string(),
            properties,
            redelivered: false,
        };
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

struct MemoryStream {
    broker: InMemoryBroker,
    queue: String,
    connection: u64,
    channel: u64,
    consumer: u64,
    prefetch: u16,
    notify: Arc<Notify>,
}

impl MemoryStream {
    /// Take the next ready message if the prefetch window allows it.
    /// `None` in the outer option means the stream has ended.
    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.channel) {
            return None;
        }
        let tag = state.allocate_id();
        let queue = state.queues.get_mut(&self.queue)?;

        let in_flight = queue
            .unacked
            .values()
            .filter(|u| u.consumer == self.consumer)
            .count();
        if self.prefetch != 0 && in_flight >= usize::from(self.prefetch) {
            return Some(None);
        }
        let Some(message) = queue.ready.pop_front() else {
            return Some(None);
        };

        queue.unacked.insert(
            tag,
            Unacked {
                message: message.clone(),
                connection: self.connection,
                channel: self.channel,
                consumer: self.consumer,
            },
        );

        Some(Some(Delivery::new(
            message.payload,
            message.routing_key,
            message.redelivered,
            message.properties,
            Box::new(MemoryAcker {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                tag,
                connection: self.connection,
            }),
        )))
    }
}

#[async_trait]
impl DeliveryStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                None => return None,
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => notified.await,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Drop,
    Requeue,
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
    connection: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker
            .settle(&self.queue, self.tag, self.connection, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Drop };
        self.broker
            .settle(&self.queue, self.tag, self.connection, outcome)
    }
}

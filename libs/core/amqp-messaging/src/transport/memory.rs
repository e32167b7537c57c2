//! Process-local broker
//!
//! Models the parts of AMQP 0-9-1 the layer relies on: the default exchange,
//! fanout/direct/topic exchanges and bindings, per-consumer prefetch,
//! ack/nack with requeue, and redelivery of unacked messages when a channel
//! closes. It also keeps counters so tests can assert on broker-side effects.

use super::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
use crate::error::MessagingError;
use crate::topology::ExchangeKind;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Counters of broker-side effects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connection_attempts: usize,
    pub connections_opened: usize,
    pub connections_closed: usize,
    /// `close` called on an already-closed connection
    pub redundant_closes: usize,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub queue_declarations: usize,
    pub exchange_declarations: usize,
    pub bindings_declared: usize,
    pub published: usize,
    pub acked: usize,
    pub nacked: usize,
    /// Messages put back by a nack with requeue
    pub requeued: usize,
    /// Unacked messages put back because their channel closed
    pub recovered: usize,
    /// Every prefetch value applied, in order
    pub prefetch_applied: Vec<u16>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message_type: Option<String>,
    body: Vec<u8>,
}

struct ConsumerEntry {
    id: u64,
    channel: u64,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, MessagingError>>,
}

impl ConsumerEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct Unacked {
    channel: u64,
    consumer: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelEntry {
    connection: u64,
    prefetch: u16,
}

#[derive(Default)]
struct BrokerInner {
    refuse_connections: bool,
    next_id: u64,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelEntry>,
    unacked: HashMap<u64, Unacked>,
    stats: BrokerStats,
}

impl BrokerInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel: u64) -> Result<&ChannelEntry, MessagingError> {
        self.channels
            .get(&channel)
            .ok_or_else(|| MessagingError::channel("channel is closed"))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, MessagingError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let state = self.exchanges.get(exchange).ok_or_else(|| {
            MessagingError::channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    /// Push ready messages to consumers with spare prefetch capacity, round robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let tag = self.next_id();
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(slot) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            queue.cursor = (slot + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let consumer = &mut queue.consumers[slot];
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                message_type: message.message_type.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                // receiver dropped without cancelling; forget the consumer
                queue.consumers.remove(slot);
                queue.cursor = 0;
                queue.ready.push_front(message);
                continue;
            }

            if !consumer.auto_ack {
                consumer.in_flight += 1;
                let unacked = Unacked {
                    channel: consumer.channel,
                    consumer: consumer.id,
                    queue: queue_name.to_string(),
                    message,
                };
                self.unacked.insert(tag, unacked);
            }
        }
    }

    fn settle(&mut self, channel: u64, tag: u64) -> Result<Unacked, MessagingError> {
        match self.unacked.get(&tag) {
            Some(entry) if entry.channel == channel => {}
            _ => {
                return Err(MessagingError::channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    tag
                )))
            }
        }
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| MessagingError::channel("delivery tag vanished"))?;

        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        Ok(entry)
    }

    fn close_channel(&mut self, channel: u64) -> bool {
        if self.channels.remove(&channel).is_none() {
            return false;
        }
        self.stats.channels_closed += 1;

        // Dropping the senders ends the consumers' delivery streams
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
            queue.cursor = 0;
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let mut touched = Vec::new();
        for tag in tags.into_iter().rev() {
            if let Some(mut entry) = self.unacked.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.ready.push_front(entry.message);
                    self.stats.recovered += 1;
                }
                if !touched.contains(&entry.queue) {
                    touched.push(entry.queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
        true
    }

    fn close_connection(&mut self, connection: u64) -> bool {
        if !self.connections.remove(&connection) {
            return false;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        self.stats.connections_closed += 1;
        true
    }
}

/// `*` matches one dot-separated word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    topic_words_match(&pattern, &words)
}

fn topic_words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_words_match(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && topic_words_match(rest, &words[1..])
        }
    }
}

/// In-memory broker, cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that opens connections to this broker
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Drop every open connection, like a broker restart
    pub fn disconnect_all(&self) {
        let mut inner = self.lock();
        let connections: Vec<u64> = inner.connections.iter().copied().collect();
        for connection in connections {
            inner.close_connection(connection);
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages waiting for a consumer
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acked or nacked
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|entry| entry.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).map(|e| e.kind)
    }

    /// (queue, binding key) pairs of an exchange
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    pub fn delete_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.remove(exchange).is_some()
    }

    /// Declare a queue out of band
    pub fn declare_queue(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    /// Declare an exchange out of band
    pub fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) {
        self.lock()
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
    }

    /// Publish without a connection, as another process would
    pub fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), MessagingError> {
        let mut inner = self.lock();
        publish_locked(&mut inner, exchange, routing_key, None, body)
    }

    /// Remove and return the ready messages of a queue
    pub fn drain_queue(&self, queue: &str) -> Vec<Delivery> {
        let mut inner = self.lock();
        let Some(state) = inner.queues.get_mut(queue) else {
            return Vec::new();
        };
        state
            .ready
            .drain(..)
            .map(|m| Delivery {
                delivery_tag: 0,
                exchange: m.exchange,
                routing_key: m.routing_key,
                redelivered: m.redelivered,
                message_type: m.message_type,
                body: m.body,
            })
            .collect()
    }
}

fn publish_locked(
    inner: &mut BrokerInner,
    exchange: &str,
    routing_key: &str,
    message_type: Option<&str>,
    body: &[u8],
) -> Result<(), MessagingError> {
    let targets = inner.route(exchange, routing_key)?;
    inner.stats.published += 1;

    for queue in &targets {
        if let Some(state) = inner.queues.get_mut(queue) {
            state.ready.push_back(StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                message_type: message_type.map(str::to_string),
                body: body.to_vec(),
            });
        }
    }
    for queue in &targets {
        inner.dispatch(queue);
    }
    Ok(())
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        let mut inner = self.lock();
        inner.stats.connection_attempts += 1;
        if inner.refuse_connections {
            return Err(MessagingError::connection("connection refused"));
        }

        let id = inner.next_id();
        inner.connections.insert(id);
        inner.stats.connections_opened += 1;
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://broker".to_string()
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MessagingError> {
        let mut inner = self.broker.lock();
        if !inner.connections.contains(&self.id) {
            return Err(MessagingError::connection("connection is closed"));
        }

        let id = inner.next_id();
        inner.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: 0,
            },
        );
        inner.stats.channels_opened += 1;
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        if !inner.close_connection(self.id) {
            inner.stats.redundant_closes += 1;
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        if queue.trim().is_empty() {
            return Err(MessagingError::declaration("queue", "blank queue name"));
        }
        inner.queues.entry(queue.to_string()).or_default();
        inner.stats.queue_declarations += 1;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        inner.stats.exchange_declarations += 1;

        if let Some(existing) = inner.exchanges.get(exchange) {
            if existing.kind != kind {
                return Err(MessagingError::declaration(
                    format!("{} exchange {}", kind, exchange),
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type': received '{}' but current is '{}'",
                        kind, existing.kind
                    ),
                ));
            }
            return Ok(());
        }

        inner.exchanges.insert(
            exchange.to_string(),
            ExchangeState {
                kind,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        if !inner.queues.contains_key(queue) {
            return Err(MessagingError::declaration(
                format!("binding {} -> {}", exchange, queue),
                format!("NOT_FOUND - no queue '{}'", queue),
            ));
        }
        let state = inner.exchanges.get_mut(exchange).ok_or_else(|| {
            MessagingError::declaration(
                format!("binding {} -> {}", exchange, queue),
                format!("NOT_FOUND - no exchange '{}'", exchange),
            )
        })?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        inner.stats.bindings_declared += 1;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        if let Some(channel) = inner.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        inner.stats.prefetch_applied.push(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        publish_locked(&mut inner, exchange, routing_key, message_type, body)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, MessagingError> {
        let mut inner = self.broker.lock();
        let prefetch = inner.ensure_channel(self.id)?.prefetch;
        if !inner.queues.contains_key(queue) {
            return Err(MessagingError::channel(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }

        let id = inner.next_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(state) = inner.queues.get_mut(queue) {
            state.consumers.push(ConsumerEntry {
                id,
                channel: self.id,
                auto_ack,
                prefetch,
                in_flight: 0,
                sender,
            });
        }
        inner.dispatch(queue);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        let entry = inner.settle(self.id, delivery_tag)?;
        inner.stats.acked += 1;
        inner.dispatch(&entry.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let mut inner = self.broker.lock();
        inner.ensure_channel(self.id)?;
        let mut entry = inner.settle(self.id, delivery_tag)?;
        inner.stats.nacked += 1;

        if requeue {
            entry.message.redelivered = true;
            if let Some(queue) = inner.queues.get_mut(&entry.queue) {
                queue.ready.push_front(entry.message);
                inner.stats.requeued += 1;
            }
        }
        inner.dispatch(&entry.queue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &InMemoryBroker) -> Box<dyn BrokerChannel> {
        let connection = broker.connect().await.unwrap();
        connection.open_channel().await.unwrap()
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("client.*", "client.deleted"));
        assert!(!topic_matches("client.*", "client.deleted.soft"));
        assert!(topic_matches("client.#", "client"));
        assert!(topic_matches("client.#", "client.deleted.soft"));
        assert!(topic_matches("#.deleted", "tenant.client.deleted"));
        assert!(topic_matches("#", ""));
        assert!(!topic_matches("order.*", "client.deleted"));
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.declare_queue("clients").await.unwrap();

        channel.publish("", "clients", Some("Client"), b"{}").await.unwrap();
        channel.publish("", "nobody", None, b"{}").await.unwrap();

        let ready = broker.drain_queue("clients");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_type.as_deref(), Some("Client"));
        assert_eq!(broker.stats().published, 2);
    }

    #[tokio::test]
    async fn test_direct_exchange_routing() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.declare_exchange("d_audit_mail", ExchangeKind::Direct).await.unwrap();
        for queue in ["audit", "mail"] {
            channel.declare_queue(queue).await.unwrap();
        }
        channel.bind_queue("audit", "d_audit_mail", "deleted").await.unwrap();
        channel.bind_queue("mail", "d_audit_mail", "inserted").await.unwrap();

        channel.publish("d_audit_mail", "deleted", None, b"1").await.unwrap();

        assert_eq!(broker.queue_depth("audit"), 1);
        assert_eq!(broker.queue_depth("mail"), 0);
    }

    #[tokio::test]
    async fn test_exchange_kind_mismatch_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeKind::Direct);
        let channel = open(&broker).await;

        let err = channel
            .declare_exchange("events", ExchangeKind::Fanout)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        for i in 0..5u8 {
            broker.publish("", "jobs", &[i]).unwrap();
        }

        let channel = open(&broker).await;
        channel.set_prefetch(2).await.unwrap();
        let mut deliveries = channel.consume("jobs", "c1", false).await.unwrap();

        assert_eq!(broker.unacked_count("jobs"), 2);
        assert_eq!(broker.queue_depth("jobs"), 3);

        let first = deliveries.next().await.unwrap().unwrap();
        channel.ack(first.delivery_tag).await.unwrap();

        assert_eq!(broker.unacked_count("jobs"), 2);
        assert_eq!(broker.queue_depth("jobs"), 2);
        assert_eq!(broker.stats().prefetch_applied, vec![2]);
    }

    #[tokio::test]
    async fn test_nack_requeue_and_channel_close_recovery() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        broker.publish("", "jobs", b"a").unwrap();
        broker.publish("", "jobs", b"b").unwrap();

        let channel = open(&broker).await;
        let mut deliveries = channel.consume("jobs", "c1", false).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert!(!first.redelivered);

        channel.nack(first.delivery_tag, true).await.unwrap();
        channel.close().await.unwrap();

        let ready = broker.drain_queue("jobs");
        let mut bodies: Vec<&[u8]> = ready.iter().map(|d| d.body.as_slice()).collect();
        bodies.sort();
        assert_eq!(bodies, vec![b"a".as_slice(), b"b".as_slice()]);
        assert!(ready.iter().all(|d| d.redelivered));

        let stats = broker.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.recovered, 2);

        // buffered deliveries drain, then the stream ends
        let leftovers: Vec<_> = deliveries.collect().await;
        assert_eq!(leftovers.len(), 2);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        broker.publish("", "jobs", b"poison").unwrap();

        let channel = open(&broker).await;
        let mut deliveries = channel.consume("jobs", "c1", false).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.queue_depth("jobs"), 0);
        assert_eq!(broker.stats().nacked, 1);
    }

    #[tokio::test]
    async fn test_refused_connection_and_disconnect() {
        let broker = InMemoryBroker::new();
        broker.set_refuse_connections(true);
        assert!(broker.connect().await.is_err());

        broker.set_refuse_connections(false);
        let connection = broker.connect().await.unwrap();
        assert!(connection.is_open());

        broker.disconnect_all();
        assert!(!connection.is_open());
        connection.close().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.connection_attempts, 2);
        assert_eq!(stats.connections_closed, 1);
        assert_eq!(stats.redundant_closes, 1);
    }
}

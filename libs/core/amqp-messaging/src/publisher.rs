//! Message publisher and topology setup
//!
//! Every publish opens its own channel on the shared connection, makes sure the
//! target queue has been declared once for this process, and sends without
//! waiting for a broker confirm.
//!
//! # Example
//!
//! ```rust,ignore
//! use amqp_messaging::{ConnectionManager, Publisher, TopologyCache};
//!
//! let publisher = Publisher::new(connections, Arc::new(TopologyCache::new()));
//!
//! // Queue named after the type ("Client")
//! publisher.send(&client, None).await?;
//!
//! // Same payload to every queue behind one fanout exchange
//! let exchange = publisher.setup_fanout(&["audit", "mail"]).await?;
//! publisher.send_to_exchange(&client, &exchange, "").await?;
//! ```

use crate::connection::{ChannelLease, ConnectionManager};
use crate::error::MessagingError;
use crate::metrics::MessagingMetrics;
use crate::registry::Message;
use crate::topology::{ExchangeKind, RoutingTable, TopologyCache, TopologyKey};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_CONCURRENCY: usize = 8;

/// Where a payload goes.
///
/// The routing key resolves to `routing_key`, else `queue`, else `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    /// `""` is the broker's default exchange
    pub exchange: String,
    /// Declared before publishing when set
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    /// Sent as the AMQP `type` property
    pub message_type: Option<String>,
}

impl Destination {
    /// Default exchange, routed straight to `queue`
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: None,
            routing_key: Some(routing_key.into()),
            message_type: None,
        }
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn resolved_routing_key(&self) -> &str {
        self.routing_key
            .as_deref()
            .or(self.queue.as_deref())
            .unwrap_or("")
    }
}

/// Publisher bound to the shared connection and the process topology cache.
#[derive(Clone)]
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    topology: Arc<TopologyCache>,
    batch_concurrency: usize,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionManager>, topology: Arc<TopologyCache>) -> Self {
        Self {
            connections,
            topology,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }

    /// Number of publishes `send_batch` keeps in flight.
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency.max(1);
        self
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    /// Publish raw bytes.
    pub async fn send_bytes(
        &self,
        body: &[u8],
        destination: &Destination,
    ) -> Result<(), MessagingError> {
        if body.is_empty() {
            return Err(MessagingError::InvalidPayload("empty message body".into()));
        }
        if let Some(queue) = &destination.queue {
            validate_queue_name(queue)?;
        }

        let metrics = MessagingMetrics::new(destination_label(destination));
        let channel = self.connections.open_channel().await?;
        let result = self.publish_on(&channel, body, destination).await;
        channel.close().await;

        match &result {
            Ok(()) => {
                metrics.message_published();
                debug!(
                    exchange = %destination.exchange,
                    routing_key = %destination.resolved_routing_key(),
                    bytes = body.len(),
                    "Message published"
                );
            }
            Err(e) => {
                metrics.publish_failed(e.kind());
                warn!(
                    exchange = %destination.exchange,
                    routing_key = %destination.resolved_routing_key(),
                    error = %e,
                    "Publish failed"
                );
            }
        }
        result
    }

    async fn publish_on(
        &self,
        channel: &ChannelLease,
        body: &[u8],
        destination: &Destination,
    ) -> Result<(), MessagingError> {
        if let Some(queue) = &destination.queue {
            self.ensure_queue(channel, queue).await?;
        }
        channel
            .publish(
                &destination.exchange,
                destination.resolved_routing_key(),
                destination.message_type.as_deref(),
                body,
            )
            .await
    }

    /// Publish UTF-8 text.
    pub async fn send_text(
        &self,
        text: &str,
        destination: &Destination,
    ) -> Result<(), MessagingError> {
        if text.trim().is_empty() {
            return Err(MessagingError::InvalidPayload("blank message text".into()));
        }
        self.send_bytes(text.as_bytes(), destination).await
    }

    /// Publish a payload as JSON on the default exchange.
    ///
    /// `queue: None` targets the queue named by `M::routing_key()`.
    pub async fn send<M: Message>(
        &self,
        message: &M,
        queue: Option<&str>,
    ) -> Result<(), MessagingError> {
        let body = serde_json::to_vec(message)?;
        let queue = queue.unwrap_or(M::routing_key());
        let destination = Destination::queue(queue).with_message_type(M::message_type());
        self.send_bytes(&body, &destination).await
    }

    /// Publish a payload as JSON to an exchange; no queue is declared.
    pub async fn send_to_exchange<M: Message>(
        &self,
        message: &M,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let body = serde_json::to_vec(message)?;
        let destination =
            Destination::exchange(exchange, routing_key).with_message_type(M::message_type());
        self.send_bytes(&body, &destination).await
    }

    /// Publish each payload individually, `batch_concurrency` at a time.
    ///
    /// Every payload is attempted. Returns how many were sent, or the first error.
    pub async fn send_batch<M: Message>(
        &self,
        messages: &[M],
        queue: Option<&str>,
    ) -> Result<usize, MessagingError> {
        let total = messages.len();
        let mut sent = 0;
        let mut first_error = None;

        for chunk in messages.chunks(self.batch_concurrency) {
            let results = join_all(chunk.iter().map(|message| self.send(message, queue))).await;
            for result in results {
                match result {
                    Ok(()) => sent += 1,
                    Err(e) if first_error.is_none() => first_error = Some(e),
                    Err(_) => {}
                }
            }
        }

        match first_error {
            Some(e) => {
                warn!(sent, total, error = %e, "Batch publish partially failed");
                Err(e)
            }
            None => {
                debug!(sent, "Batch published");
                Ok(sent)
            }
        }
    }

    /// Fanout exchange named `f_{queues...}`; every queue gets every message.
    pub async fn setup_fanout(&self, queues: &[&str]) -> Result<String, MessagingError> {
        let routing = RoutingTable::from_queues(queues.iter().copied());
        let exchange = routing.derived_exchange_name(ExchangeKind::Fanout);
        self.setup_exchange(ExchangeKind::Fanout, &exchange, &routing)
            .await?;
        Ok(exchange)
    }

    pub async fn setup_fanout_named(
        &self,
        exchange: &str,
        queues: &[&str],
    ) -> Result<(), MessagingError> {
        let routing = RoutingTable::from_queues(queues.iter().copied());
        self.setup_exchange(ExchangeKind::Fanout, exchange, &routing)
            .await
    }

    /// Direct exchange named `d_{queues...}`.
    pub async fn setup_direct(&self, routing: &RoutingTable) -> Result<String, MessagingError> {
        let exchange = routing.derived_exchange_name(ExchangeKind::Direct);
        self.setup_exchange(ExchangeKind::Direct, &exchange, routing)
            .await?;
        Ok(exchange)
    }

    pub async fn setup_direct_named(
        &self,
        exchange: &str,
        routing: &RoutingTable,
    ) -> Result<(), MessagingError> {
        self.setup_exchange(ExchangeKind::Direct, exchange, routing)
            .await
    }

    /// Topic exchange named `t_{queues...}`.
    pub async fn setup_topic(&self, routing: &RoutingTable) -> Result<String, MessagingError> {
        let exchange = routing.derived_exchange_name(ExchangeKind::Topic);
        self.setup_exchange(ExchangeKind::Topic, &exchange, routing)
            .await?;
        Ok(exchange)
    }

    pub async fn setup_topic_named(
        &self,
        exchange: &str,
        routing: &RoutingTable,
    ) -> Result<(), MessagingError> {
        self.setup_exchange(ExchangeKind::Topic, exchange, routing)
            .await
    }

    /// Declare an exchange, its queues and bindings once per process.
    pub async fn setup_exchange(
        &self,
        kind: ExchangeKind,
        exchange: &str,
        routing: &RoutingTable,
    ) -> Result<(), MessagingError> {
        if exchange.trim().is_empty() {
            return Err(MessagingError::InvalidTopology(
                "exchange name is blank".into(),
            ));
        }
        if routing.is_empty() {
            return Err(MessagingError::InvalidTopology(format!(
                "{} exchange {} has no queues",
                kind, exchange
            )));
        }
        for queue in routing.queues() {
            validate_queue_name(queue)?;
        }

        let key = TopologyKey::exchange(kind, exchange, routing.clone());
        let declared = self
            .topology
            .ensure_declared(&key, || async {
                let channel = self.connections.open_channel().await?;
                let result = self.declare_exchange_on(&channel, kind, exchange, routing).await;
                channel.close().await;
                result
            })
            .await?;

        if declared {
            info!(
                exchange = %exchange,
                kind = %kind,
                queues = routing.len(),
                fingerprint = %key.fingerprint(),
                "Exchange topology declared"
            );
        }
        Ok(())
    }

    async fn declare_exchange_on(
        &self,
        channel: &ChannelLease,
        kind: ExchangeKind,
        exchange: &str,
        routing: &RoutingTable,
    ) -> Result<(), MessagingError> {
        channel.declare_exchange(exchange, kind).await?;
        for (queue, keys) in routing.iter() {
            self.ensure_queue(channel, queue).await?;
            for key in keys {
                channel.bind_queue(queue, exchange, key).await?;
            }
        }
        Ok(())
    }

    async fn ensure_queue(&self, channel: &ChannelLease, queue: &str) -> Result<(), MessagingError> {
        self.topology
            .ensure_declared(&TopologyKey::queue(queue), || channel.declare_queue(queue))
            .await?;
        Ok(())
    }
}

pub(crate) fn validate_queue_name(queue: &str) -> Result<(), MessagingError> {
    if queue.trim().is_empty() {
        return Err(MessagingError::InvalidQueueName(queue.to_string()));
    }
    Ok(())
}

fn destination_label(destination: &Destination) -> String {
    if destination.exchange.is_empty() {
        destination.resolved_routing_key().to_string()
    } else {
        destination.exchange.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, InMemoryBroker};
    use futures::StreamExt;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        number: u32,
    }

    impl Message for Invoice {}

    fn publisher(broker: &InMemoryBroker) -> Publisher {
        Publisher::new(
            ConnectionManager::new(broker.connector()),
            Arc::new(TopologyCache::new()),
        )
    }

    #[test]
    fn test_destination_routing_key_resolution() {
        assert_eq!(Destination::queue("clients").resolved_routing_key(), "clients");
        assert_eq!(
            Destination::exchange("f_a_b", "").resolved_routing_key(),
            ""
        );

        let explicit = Destination {
            exchange: String::new(),
            queue: Some("clients".into()),
            routing_key: Some("other".into()),
            message_type: None,
        };
        assert_eq!(explicit.resolved_routing_key(), "other");
        assert_eq!(Destination::default().resolved_routing_key(), "");
    }

    #[tokio::test]
    async fn test_queue_declared_once_across_publishes() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        for number in 0..3 {
            publisher.send(&Invoice { number }, None).await.unwrap();
        }

        assert_eq!(broker.stats().queue_declarations, 1);
        assert_eq!(broker.queue_depth("Invoice"), 3);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_consumer_receives_message_type() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.send(&Invoice { number: 1 }, None).await.unwrap();

        broker.declare_exchange("billing", ExchangeKind::Fanout);
        broker.declare_queue("ledger");
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.bind_queue("ledger", "billing", "").await.unwrap();
        publisher
            .send_to_exchange(&Invoice { number: 2 }, "billing", "")
            .await
            .unwrap();

        for queue in ["Invoice", "ledger"] {
            let mut deliveries = channel.consume(queue, "reader", true).await.unwrap();
            let delivery = deliveries.next().await.unwrap().unwrap();
            assert_eq!(delivery.message_type.as_deref(), Some("Invoice"));
        }
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_blank_queue_and_empty_body() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        let err = publisher
            .send(&Invoice { number: 1 }, Some("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidQueueName(_)));

        let err = publisher
            .send_bytes(b"", &Destination::queue("Invoice"))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidPayload(_)));

        let err = publisher
            .send_text(" \n", &Destination::queue("Invoice"))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidPayload(_)));

        assert_eq!(broker.stats().connection_attempts, 0);
    }

    #[tokio::test]
    async fn test_send_text_to_named_queue() {
        let broker = InMemoryBroker::new();
        publisher(&broker)
            .send_text("hello", &Destination::queue("greetings"))
            .await
            .unwrap();

        let delivered = broker.drain_queue("greetings");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, b"hello");
        assert_eq!(delivered[0].routing_key, "greetings");
        assert_eq!(delivered[0].message_type, None);
    }

    #[tokio::test]
    async fn test_send_batch_publishes_each_payload() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker).with_batch_concurrency(3);
        let invoices: Vec<Invoice> = (0..10).map(|number| Invoice { number }).collect();

        let sent = publisher.send_batch(&invoices, Some("invoices")).await.unwrap();

        assert_eq!(sent, 10);
        assert_eq!(broker.queue_depth("invoices"), 10);
        assert_eq!(broker.stats().published, 10);
        assert_eq!(broker.stats().queue_declarations, 1);
    }

    #[tokio::test]
    async fn test_send_to_missing_exchange_fails() {
        let broker = InMemoryBroker::new();
        let err = publisher(&broker)
            .send_to_exchange(&Invoice { number: 1 }, "nowhere", "key")
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Channel(_)));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_setup_direct_binds_each_key() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let routing = RoutingTable::new()
            .route_list("audit", "client_inserted; client_deleted")
            .route_list("mail", "client_inserted");

        let exchange = publisher.setup_direct(&routing).await.unwrap();
        assert_eq!(exchange, "d_audit_mail");
        assert_eq!(broker.exchange_kind(&exchange), Some(ExchangeKind::Direct));
        assert_eq!(broker.bindings(&exchange).len(), 3);

        publisher
            .send_to_exchange(&Invoice { number: 1 }, &exchange, "client_deleted")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("audit"), 1);
        assert_eq!(broker.queue_depth("mail"), 0);
    }

    #[tokio::test]
    async fn test_setup_topic_pattern_routing() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let routing = RoutingTable::new()
            .route("all_clients", ["client.#"])
            .route("deletions", ["*.deleted"]);

        let exchange = publisher.setup_topic(&routing).await.unwrap();
        assert_eq!(exchange, "t_all_clients_deletions");

        publisher
            .send_to_exchange(&Invoice { number: 1 }, &exchange, "client.deleted")
            .await
            .unwrap();
        publisher
            .send_to_exchange(&Invoice { number: 2 }, &exchange, "client.inserted")
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("all_clients"), 2);
        assert_eq!(broker.queue_depth("deletions"), 1);
    }

    #[tokio::test]
    async fn test_setup_rejects_malformed_topology() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        let err = publisher.setup_fanout(&[]).await.unwrap_err();
        assert!(matches!(err, MessagingError::InvalidTopology(_)));

        let err = publisher
            .setup_fanout_named(" ", &["audit"])
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidTopology(_)));

        let err = publisher.setup_fanout(&["audit", ""]).await.unwrap_err();
        assert!(matches!(err, MessagingError::InvalidQueueName(_)));
    }

    #[tokio::test]
    async fn test_failed_exchange_declaration_is_not_cached() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeKind::Direct);
        let publisher = publisher(&broker);

        let err = publisher
            .setup_fanout_named("events", &["audit"])
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Declaration { .. }));

        broker.delete_exchange("events");
        publisher
            .setup_fanout_named("events", &["audit"])
            .await
            .unwrap();
        assert_eq!(broker.exchange_kind("events"), Some(ExchangeKind::Fanout));
        assert_eq!(broker.stats().exchange_declarations, 2);
    }
}

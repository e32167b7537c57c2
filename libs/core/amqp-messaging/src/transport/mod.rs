//! Broker transport seam
//!
//! The rest of the crate talks to the broker only through these three traits.
//! [`AmqpConnector`] backs them with `lapin`; [`InMemoryBroker`] is a process-local
//! broker with the same queue, exchange and acknowledgement semantics.

mod amqp;
mod memory;

pub use amqp::AmqpConnector;
pub use memory::{BrokerStats, InMemoryBroker};

use crate::error::MessagingError;
use crate::topology::ExchangeKind;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// Payload type name set by the publisher, if any
    pub message_type: Option<String>,
    pub body: Vec<u8>,
}

/// Deliveries for one consumer; ends when the broker stops the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// Opens physical broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError>;

    /// Target description for logs, without secrets
    fn describe(&self) -> String;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MessagingError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// A lightweight session on a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Non-durable, non-exclusive, non-auto-delete queue
    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError>;

    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind)
        -> Result<(), MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    /// Per-consumer limit on unacked deliveries
    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError>;

    /// Fire-and-forget; the publisher confirm is not awaited.
    ///
    /// `message_type` travels as the AMQP `type` property.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), MessagingError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, MessagingError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), MessagingError>;
}

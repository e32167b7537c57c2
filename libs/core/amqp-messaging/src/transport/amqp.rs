use super::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
use crate::error::MessagingError;
use crate::topology::ExchangeKind;
use async_trait::async_trait;
use core_config::amqp::AmqpConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::debug;

const REPLY_SUCCESS: u16 = 200;

/// [`Connector`] backed by a RabbitMQ broker through `lapin`
#[derive(Clone)]
pub struct AmqpConnector {
    uri: String,
    redacted_uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            redacted_uri: uri.clone(),
            uri,
        }
    }

    pub fn from_config(config: &AmqpConfig) -> Self {
        Self {
            uri: config.uri(),
            redacted_uri: config.redacted_uri(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(MessagingError::connection)?;

        debug!(uri = %self.redacted_uri, "AMQP connection established");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }

    fn describe(&self) -> String {
        self.redacted_uri.clone()
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MessagingError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(MessagingError::connection)?;
        Ok(Box::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(MessagingError::connection)
    }
}

struct AmqpChannel {
    inner: Channel,
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError> {
        let options = QueueDeclareOptions {
            durable: false,
            exclusive: false,
            auto_delete: false,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| MessagingError::declaration(format!("queue {}", queue), e))?;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), MessagingError> {
        self.inner
            .exchange_declare(
                exchange,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::declaration(format!("{} exchange {}", kind, exchange), e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::declaration(
                    format!("binding {} -> {} ({:?})", exchange, queue, routing_key),
                    e,
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(MessagingError::channel)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        let properties = BasicProperties::default().with_content_type("application/json".into());
        let properties = match message_type {
            Some(kind) => properties.with_kind(kind.into()),
            None => properties,
        };

        // The returned confirm is dropped unawaited
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(MessagingError::channel)?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, MessagingError> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(MessagingError::channel)?;

        let deliveries = consumer.map(|item| {
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                message_type: delivery
                    .properties
                    .kind()
                    .as_ref()
                    .map(|kind| kind.as_str().to_string()),
                body: delivery.data,
            })
            .map_err(MessagingError::connection)
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(MessagingError::channel)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(MessagingError::channel)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(MessagingError::channel)
    }
}

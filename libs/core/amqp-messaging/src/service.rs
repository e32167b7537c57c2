//! Application-facing messaging facade
//!
//! Bundles one connection manager, topology cache, publisher and consumer registry.
//! Every call logs its failures; whether it also returns them depends on the
//! [`ErrorPolicy`].
//!
//! ```rust,ignore
//! let service = MessageService::new(ConnectionManager::new(connector))
//!     .with_default_prefetch(config.default_prefetch);
//!
//! service.publish(client, Some(routing_keys::CLIENT_DELETED)).await??;
//! ```

use crate::config::ConsumeOptions;
use crate::connection::ConnectionManager;
use crate::consumer::ConsumerRegistry;
use crate::error::{HandlerError, MessagingError};
use crate::publisher::Publisher;
use crate::registry::{Message, MessageHandler};
use crate::topology::TopologyCache;
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::task::JoinHandle;
use tracing::error;

/// What a failed call returns after it has been logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ErrorPolicy {
    /// Return the error to the caller
    Propagate,
    /// Log only; the call reports success (`Ok(())` or `Ok(false)`)
    Swallow,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ErrorPolicy::Propagate
        } else {
            ErrorPolicy::Swallow
        }
    }
}

impl ErrorPolicy {
    fn apply<T>(self, result: Result<T, MessagingError>, fallback: T) -> Result<T, MessagingError> {
        match (self, result) {
            (_, Ok(value)) => Ok(value),
            (ErrorPolicy::Propagate, Err(e)) => Err(e),
            (ErrorPolicy::Swallow, Err(_)) => Ok(fallback),
        }
    }
}

#[derive(Clone)]
pub struct MessageService {
    publisher: Publisher,
    consumers: Arc<ConsumerRegistry>,
    connections: Arc<ConnectionManager>,
    topology: Arc<TopologyCache>,
    policy: ErrorPolicy,
}

impl MessageService {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        let topology = Arc::new(TopologyCache::new());
        Self {
            publisher: Publisher::new(Arc::clone(&connections), Arc::clone(&topology)),
            consumers: Arc::new(ConsumerRegistry::new(
                Arc::clone(&connections),
                Arc::clone(&topology),
            )),
            connections,
            topology,
            policy: ErrorPolicy::default(),
        }
    }

    /// Rebuilds the consumer registry; call before registering anything.
    pub fn with_default_prefetch(mut self, prefetch: Option<u16>) -> Self {
        self.consumers = Arc::new(
            ConsumerRegistry::new(Arc::clone(&self.connections), Arc::clone(&self.topology))
                .with_default_prefetch(prefetch),
        );
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.consumers
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Publish one payload on a spawned task.
    ///
    /// `routing_key: None` targets the queue named after `M`.
    pub fn publish<M: Message>(
        &self,
        message: M,
        routing_key: Option<&str>,
    ) -> JoinHandle<Result<(), MessagingError>> {
        let publisher = self.publisher.clone();
        let policy = self.policy;
        let queue = routing_key.map(str::to_string);
        tokio::spawn(async move {
            let result = publisher.send(&message, queue.as_deref()).await;
            if let Err(e) = &result {
                error!(
                    message_type = %M::message_type(),
                    queue = %queue.as_deref().unwrap_or(M::routing_key()),
                    error = %e,
                    "Publish failed"
                );
            }
            policy.apply(result, ())
        })
    }

    /// Publish several payloads on one spawned task.
    pub fn publish_all<M: Message>(
        &self,
        messages: Vec<M>,
        routing_key: Option<&str>,
    ) -> JoinHandle<Result<(), MessagingError>> {
        let publisher = self.publisher.clone();
        let policy = self.policy;
        let queue = routing_key.map(str::to_string);
        tokio::spawn(async move {
            let result = publisher
                .send_batch(&messages, queue.as_deref())
                .await
                .map(|_| ());
            if let Err(e) = &result {
                error!(
                    message_type = %M::message_type(),
                    count = messages.len(),
                    error = %e,
                    "Batch publish failed"
                );
            }
            policy.apply(result, ())
        })
    }

    /// Consume `M` until unregistered or the session ends.
    ///
    /// `requeue` controls whether a failed delivery goes back to the queue. `balance`
    /// is the prefetch count, the number of unacknowledged messages each consumer
    /// may hold; 0 falls back to the registry default.
    pub async fn register_consume<M, H>(
        &self,
        handler: H,
        routing_key: Option<&str>,
        requeue: bool,
        balance: u16,
    ) -> Result<bool, MessagingError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let options = consume_options(routing_key, requeue, balance);
        let result = self.consumers.register::<M, H>(handler, options).await;
        log_registration::<M>(&result, routing_key);
        self.policy.apply(result, false)
    }

    /// [`register_consume`](Self::register_consume) on a spawned task.
    ///
    /// The registration is in place when this returns.
    pub fn register_consume_async<M, H>(
        &self,
        handler: H,
        routing_key: Option<&str>,
        requeue: bool,
        balance: u16,
    ) -> JoinHandle<Result<bool, MessagingError>>
    where
        M: Message,
        H: MessageHandler<M> + 'static,
    {
        let options = consume_options(routing_key, requeue, balance);
        let session = self.consumers.spawn_register::<M, H>(handler, options);
        let policy = self.policy;
        let queue = routing_key.map(str::to_string);
        tokio::spawn(async move {
            let result = match session.await {
                Ok(result) => result,
                Err(e) => Err(MessagingError::Handler {
                    handler: "consumer task".to_string(),
                    queue: queue.clone().unwrap_or_else(|| M::routing_key().to_string()),
                    source: HandlerError::Panicked(e.to_string()),
                }),
            };
            log_registration::<M>(&result, queue.as_deref());
            policy.apply(result, false)
        })
    }

    pub fn unregister_consume<M: Message>(&self, routing_key: Option<&str>) -> bool {
        self.consumers.unregister::<M>(routing_key)
    }

    pub fn unregister_all(&self) -> usize {
        self.consumers.unregister_all()
    }
}

fn log_registration<M: Message>(result: &Result<bool, MessagingError>, routing_key: Option<&str>) {
    if let Err(e) = result {
        error!(
            message_type = %M::message_type(),
            queue = %routing_key.unwrap_or(M::routing_key()),
            error = %e,
            "Consumer registration failed"
        );
    }
}

fn consume_options(routing_key: Option<&str>, requeue: bool, balance: u16) -> ConsumeOptions {
    let options = ConsumeOptions::default()
        .with_requeue(requeue)
        .with_prefetch(balance);
    match routing_key {
        Some(queue) => options.with_queue(queue),
        None => options,
    }
}

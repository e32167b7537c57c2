//! Consumer registration and dispatch
//!
//! A registration binds one payload type to one queue. While it lives, its session
//! owns a dedicated channel and delivers each message to the handler in order:
//!
//! ```text
//! Unregistered -> Registering -> Consuming -> Closed{Clean | Error | Shutdown} -> Unregistered
//! ```
//!
//! An unregistered session stays in the map as `Closing` until it has released its
//! channel, so the same (payload type, queue) cannot be registered twice meanwhile.
//!
//! The first handler failure nacks that delivery and ends the session; restarting is
//! the supervisor's job.

use crate::config::ConsumeOptions;
use crate::connection::{ChannelLease, ConnectionManager};
use crate::error::{HandlerError, MessagingError};
use crate::metrics::MessagingMetrics;
use crate::publisher::validate_queue_name;
use crate::registry::{Message, MessageHandler};
use crate::topology::{TopologyCache, TopologyKey};
use crate::transport::Delivery;
use futures::{FutureExt, StreamExt};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a live registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    /// Channel, prefetch and queue are being set up
    Registering,
    Consuming,
    /// Unregistered, the session is still shutting down
    Closing,
}

/// How a consume session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SessionOutcome {
    /// Exit signal from `unregister`
    ClosedClean,
    /// A handler failed
    ClosedByError,
    /// The broker ended the delivery stream
    ClosedByShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistrationKey {
    type_id: TypeId,
    type_name: &'static str,
    queue: String,
}

impl RegistrationKey {
    fn of<M: Message>(queue: &str) -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            type_name: M::message_type(),
            queue: queue.to_string(),
        }
    }
}

struct ActiveConsumer {
    id: u64,
    state: ConsumerState,
    exit: watch::Sender<bool>,
}

/// Registry of live consumer sessions, at most one per (payload type, queue)
pub struct ConsumerRegistry {
    connections: Arc<ConnectionManager>,
    topology: Arc<TopologyCache>,
    default_prefetch: Option<u16>,
    active: Mutex<HashMap<RegistrationKey, ActiveConsumer>>,
    next_id: AtomicU64,
}

/// A claimed slot in the registry map.
///
/// Dropping it removes the entry on every exit path, unless a newer one replaced it.
struct Registration<R: Deref<Target = ConsumerRegistry>> {
    registry: R,
    key: RegistrationKey,
    id: u64,
    exit: watch::Receiver<bool>,
}

impl<R: Deref<Target = ConsumerRegistry>> Drop for Registration<R> {
    fn drop(&mut self) {
        let mut active = self.registry.lock();
        if active.get(&self.key).is_some_and(|c| c.id == self.id) {
            active.remove(&self.key);
        }
    }
}

enum SessionEnd {
    Finished(SessionOutcome, Option<MessagingError>),
    Failed(MessagingError),
}

impl ConsumerRegistry {
    pub fn new(connections: Arc<ConnectionManager>, topology: Arc<TopologyCache>) -> Self {
        Self {
            connections,
            topology,
            default_prefetch: None,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Prefetch for registrations that don't set one (`AMQP_DBC`)
    pub fn with_default_prefetch(mut self, prefetch: Option<u16>) -> Self {
        self.default_prefetch = prefetch.filter(|n| *n > 0);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RegistrationKey, ActiveConsumer>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve_queue<M: Message>(queue: Option<&str>) -> Result<String, MessagingError> {
        let queue = queue.unwrap_or(M::routing_key());
        validate_queue_name(queue)?;
        Ok(queue.to_string())
    }

    /// Consume `M` from a queue until the session ends.
    ///
    /// Returns `Ok(true)` when ended by [`unregister`](Self::unregister),
    /// `Ok(false)` when the broker closed the consumer or a handler failed with
    /// `propagate_errors` off, and `Err` for setup, stream or (propagated) handler
    /// failures. A second registration for the same type and queue fails with
    /// [`MessagingError::AlreadyRegistered`] without touching the broker.
    pub async fn register<M, H>(
        &self,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<bool, MessagingError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let registration = Self::claim::<M, _>(self, options.queue.as_deref())?;
        self.consume::<M, H, _>(registration, handler, options).await
    }

    /// Insert the registration entry, or fail if the key is taken.
    fn claim<M: Message, R: Deref<Target = Self>>(
        registry: R,
        queue: Option<&str>,
    ) -> Result<Registration<R>, MessagingError> {
        let queue = Self::resolve_queue::<M>(queue)?;
        let key = RegistrationKey::of::<M>(&queue);
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (exit_tx, exit_rx) = watch::channel(false);

        {
            let mut active = registry.lock();
            if active.contains_key(&key) {
                warn!(message_type = %key.type_name, queue = %queue, "Consumer already registered");
                return Err(MessagingError::AlreadyRegistered {
                    message_type: key.type_name.to_string(),
                    queue,
                });
            }
            active.insert(
                key.clone(),
                ActiveConsumer {
                    id,
                    state: ConsumerState::Registering,
                    exit: exit_tx,
                },
            );
        }

        Ok(Registration {
            registry,
            key,
            id,
            exit: exit_rx,
        })
    }

    async fn consume<M, H, R>(
        &self,
        mut registration: Registration<R>,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<bool, MessagingError>
    where
        M: Message,
        H: MessageHandler<M>,
        R: Deref<Target = Self>,
    {
        let key = registration.key.clone();
        let queue = key.queue.clone();

        if *registration.exit.borrow() {
            info!(message_type = %key.type_name, queue = %queue, "Consumer unregistered before start");
            return Ok(true);
        }

        info!(
            message_type = %key.type_name,
            queue = %queue,
            handler = %handler.name(),
            state = %ConsumerState::Registering,
            "Registering consumer"
        );

        let channel = self.connections.open_channel().await?;
        let end = self
            .run_session::<M, H>(
                &channel,
                &handler,
                &key,
                registration.id,
                &options,
                &mut registration.exit,
            )
            .await;
        channel.close().await;

        match end {
            SessionEnd::Finished(outcome, failure) => {
                info!(
                    message_type = %key.type_name,
                    queue = %queue,
                    outcome = %outcome,
                    "Consumer session ended"
                );
                match (outcome, failure) {
                    (SessionOutcome::ClosedClean, _) => Ok(true),
                    (_, Some(e)) if options.propagate_errors => Err(e),
                    _ => Ok(false),
                }
            }
            SessionEnd::Failed(e) => {
                error!(
                    message_type = %key.type_name,
                    queue = %queue,
                    error = %e,
                    "Consumer session failed"
                );
                Err(e)
            }
        }
    }

    async fn run_session<M, H>(
        &self,
        channel: &ChannelLease,
        handler: &H,
        key: &RegistrationKey,
        id: u64,
        options: &ConsumeOptions,
        exit_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let queue = key.queue.as_str();
        let metrics = MessagingMetrics::new(queue);

        let prefetch = match options.prefetch {
            0 => self.default_prefetch,
            n => Some(n),
        };
        if let Some(count) = prefetch {
            if let Err(e) = channel.set_prefetch(count).await {
                return SessionEnd::Failed(e);
            }
        }

        let declared = self
            .topology
            .ensure_declared(&TopologyKey::queue(queue), || channel.declare_queue(queue))
            .await;
        if let Err(e) = declared {
            return SessionEnd::Failed(e);
        }

        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4()));
        let mut deliveries = match channel.consume(queue, &tag, options.auto_ack).await {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Failed(e),
        };

        self.mark_consuming(key, id);
        metrics.consumer_started();
        info!(
            queue = %queue,
            consumer_tag = %tag,
            prefetch = ?prefetch,
            auto_ack = options.auto_ack,
            state = %ConsumerState::Consuming,
            "Consumer started"
        );

        let end = loop {
            tokio::select! {
                biased;

                _ = exit_rx.changed() => {
                    break SessionEnd::Finished(SessionOutcome::ClosedClean, None);
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        metrics.message_received();
                        if let Err(e) = self
                            .dispatch::<M, H>(channel, handler, &delivery, queue, options, &metrics)
                            .await
                        {
                            break SessionEnd::Finished(SessionOutcome::ClosedByError, Some(e));
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => {
                        warn!(queue = %queue, "Broker closed the consumer");
                        break SessionEnd::Finished(SessionOutcome::ClosedByShutdown, None);
                    }
                },
            }
        };

        let outcome = match &end {
            SessionEnd::Finished(outcome, _) => outcome.to_string(),
            SessionEnd::Failed(_) => "failed".to_string(),
        };
        metrics.consumer_stopped(&outcome);
        end
    }

    /// Decode, call the handler and settle one delivery.
    async fn dispatch<M, H>(
        &self,
        channel: &ChannelLease,
        handler: &H,
        delivery: &Delivery,
        queue: &str,
        options: &ConsumeOptions,
        metrics: &MessagingMetrics,
    ) -> Result<(), MessagingError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let started = Instant::now();
        let outcome = match serde_json::from_slice::<M>(&delivery.body) {
            Ok(message) => AssertUnwindSafe(handler.handle(message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic)))),
            Err(e) => Err(HandlerError::Decode(e)),
        };

        match outcome {
            Ok(()) => {
                if !options.auto_ack && channel.is_open() {
                    channel.ack(delivery.delivery_tag).await?;
                }
                metrics.message_handled(handler.name(), started.elapsed());
                debug!(
                    queue = %queue,
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    message_type = ?delivery.message_type,
                    "Message handled"
                );
                Ok(())
            }
            Err(source) => {
                if !options.auto_ack && channel.is_open() {
                    if let Err(e) = channel.nack(delivery.delivery_tag, options.requeue).await {
                        warn!(queue = %queue, error = %e, "Nack failed");
                    }
                }
                metrics.handler_failed(handler.name(), source.label(), options.requeue);
                error!(
                    queue = %queue,
                    handler = %handler.name(),
                    delivery_tag = delivery.delivery_tag,
                    message_type = ?delivery.message_type,
                    requeue = options.requeue,
                    error = %source,
                    "Handler failed, closing consumer"
                );
                Err(MessagingError::Handler {
                    handler: handler.name().to_string(),
                    queue: queue.to_string(),
                    source,
                })
            }
        }
    }

    fn mark_consuming(&self, key: &RegistrationKey, id: u64) {
        let mut active = self.lock();
        if let Some(consumer) = active
            .get_mut(key)
            .filter(|c| c.id == id && c.state == ConsumerState::Registering)
        {
            consumer.state = ConsumerState::Consuming;
        }
    }

    /// Run [`register`](Self::register) on a spawned task.
    ///
    /// The registration is in place when this returns, so an immediate
    /// [`unregister`](Self::unregister) always reaches it.
    pub fn spawn_register<M, H>(
        self: &Arc<Self>,
        handler: H,
        options: ConsumeOptions,
    ) -> JoinHandle<Result<bool, MessagingError>>
    where
        M: Message,
        H: MessageHandler<M> + 'static,
    {
        let registration = match Self::claim::<M, _>(Arc::clone(self), options.queue.as_deref()) {
            Ok(registration) => registration,
            Err(e) => return tokio::spawn(async move { Err(e) }),
        };
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry
                .consume::<M, H, _>(registration, handler, options)
                .await
        })
    }

    /// Signal the session for `M` on `queue` to stop.
    ///
    /// The entry is kept as `Closing` until the session has shut down. Returns `false`
    /// when nothing live was registered.
    pub fn unregister<M: Message>(&self, queue: Option<&str>) -> bool {
        let queue = queue.unwrap_or(M::routing_key());
        let key = RegistrationKey::of::<M>(queue);
        let mut active = self.lock();
        match active.get_mut(&key) {
            Some(consumer) if consumer.state != ConsumerState::Closing => {
                consumer.state = ConsumerState::Closing;
                consumer.exit.send_replace(true);
                info!(message_type = %key.type_name, queue = %queue, "Consumer unregistered");
                true
            }
            _ => false,
        }
    }

    /// Signal every live session to stop; returns how many were signalled.
    pub fn unregister_all(&self) -> usize {
        let mut active = self.lock();
        let mut signalled = 0;
        for consumer in active.values_mut() {
            if consumer.state != ConsumerState::Closing {
                consumer.state = ConsumerState::Closing;
                consumer.exit.send_replace(true);
                signalled += 1;
            }
        }
        if signalled > 0 {
            info!(count = signalled, "All consumers unregistered");
        }
        signalled
    }

    /// Registered and not yet unregistered
    pub fn is_registered<M: Message>(&self, queue: Option<&str>) -> bool {
        self.state::<M>(queue)
            .is_some_and(|state| state != ConsumerState::Closing)
    }

    pub fn state<M: Message>(&self, queue: Option<&str>) -> Option<ConsumerState> {
        let key = RegistrationKey::of::<M>(queue.unwrap_or(M::routing_key()));
        self.lock().get(&key).map(|c| c.state)
    }

    /// Entries in the map, including sessions still closing
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

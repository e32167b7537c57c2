//! Message payload and handler traits.
//!
//! - `Message`: wire payloads (JSON serializable, named after their type)
//! - `MessageHandler`: async callback invoked once per delivery

use crate::error::HandlerError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Last path segment of a type name, without generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A payload that travels through the broker as JSON.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Invoice { id: Uuid, total: i64 }
///
/// impl Message for Invoice {}
///
/// // published to and consumed from the queue "Invoice"
/// assert_eq!(Invoice::routing_key(), "Invoice");
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type name used in logs and registration keys
    fn message_type() -> &'static str {
        short_type_name::<Self>()
    }

    /// Queue used when the caller does not name one
    fn routing_key() -> &'static str {
        Self::message_type()
    }
}

/// Handler for one payload type.
///
/// Return `Ok(())` to ack the delivery. Any error nacks it and ends the consumer
/// session; the supervisor decides whether to start a new one.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync {
    async fn handle(&self, message: M) -> Result<(), HandlerError>;

    /// Handler name for logging and metrics
    fn name(&self) -> &'static str {
        short_type_name::<Self>()
    }
}

#[async_trait]
impl<M, H> MessageHandler<M> for Arc<H>
where
    M: Message,
    H: MessageHandler<M> + ?Sized,
{
    async fn handle(&self, message: M) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Adapts a synchronous closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Wrap a closure as a handler.
///
/// ```rust,ignore
/// let handler = handler_fn("audit", |client: Client| {
///     info!(uuid = %client.uuid, "Client deleted");
///     Ok(())
/// });
/// ```
pub fn handler_fn<M, F>(name: &'static str, f: F) -> FnHandler<F>
where
    M: Message,
    F: Fn(M) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler { name, f }
}

#[async_trait]
impl<M, F> MessageHandler<M> for FnHandler<F>
where
    M: Message,
    F: Fn(M) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, message: M) -> Result<(), HandlerError> {
        (self.f)(message)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

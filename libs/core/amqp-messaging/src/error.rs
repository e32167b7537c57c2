//! Messaging error types and error classification
//!
//! Every failure the layer reports falls into one of five kinds:
//! - **Connection**: broker unreachable, authentication refused, channel closed under us
//! - **Declaration**: a queue, exchange or binding could not be declared, or was malformed
//! - **Handler**: the registered handler rejected or could not decode a payload
//! - **DuplicateRegistration**: the (payload type, queue) pair already has a live consumer
//! - **RestartsExhausted**: the supervisor gave up on a consumer

use std::error::Error as StdError;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Classification of a [`MessagingError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Declaration,
    Handler,
    DuplicateRegistration,
    RestartsExhausted,
}

/// Messaging layer errors
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Broker connection could not be opened or was lost
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Channel-level failure (publish, ack, consume)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Broker rejected a queue, exchange or binding declaration
    #[error("Failed to declare {target}: {message}")]
    Declaration { target: String, message: String },

    /// Topology request is malformed before it reaches the broker
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    /// Empty or blank payload handed to the publisher
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Handler failure surfaced by a consumer session
    #[error("Handler {handler} failed on queue {queue}: {source}")]
    Handler {
        handler: String,
        queue: String,
        #[source]
        source: HandlerError,
    },

    #[error("A consumer for {message_type} is already registered on queue {queue}")]
    AlreadyRegistered { message_type: String, queue: String },

    #[error("Consumer gave up after {attempts} failed registration attempts")]
    RestartsExhausted { attempts: u32 },
}

impl MessagingError {
    pub fn declaration(target: impl Into<String>, message: impl ToString) -> Self {
        MessagingError::Declaration {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn connection(message: impl ToString) -> Self {
        MessagingError::Connection(message.to_string())
    }

    pub fn channel(message: impl ToString) -> Self {
        MessagingError::Channel(message.to_string())
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::Connection(_) | MessagingError::Channel(_) => ErrorKind::Connection,
            MessagingError::Declaration { .. }
            | MessagingError::InvalidTopology(_)
            | MessagingError::InvalidQueueName(_)
            | MessagingError::InvalidPayload(_) => ErrorKind::Declaration,
            MessagingError::Serialization(_) | MessagingError::Handler { .. } => {
                ErrorKind::Handler
            }
            MessagingError::AlreadyRegistered { .. } => ErrorKind::DuplicateRegistration,
            MessagingError::RestartsExhausted { .. } => ErrorKind::RestartsExhausted,
        }
    }

    /// Whether a fresh attempt has a reasonable chance of succeeding
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Handler)
    }
}

/// Error returned by a message handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Payload was not valid JSON for the registered type
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        HandlerError::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            HandlerError::Decode(_) => "decode",
            HandlerError::Failed { .. } => "failed",
            HandlerError::Panicked(_) => "panicked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            MessagingError::connection("refused").kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            MessagingError::declaration("queue orders", "PRECONDITION_FAILED").kind(),
            ErrorKind::Declaration
        );
        assert_eq!(
            MessagingError::InvalidQueueName("  ".into()).kind(),
            ErrorKind::Declaration
        );
        assert_eq!(
            MessagingError::AlreadyRegistered {
                message_type: "Client".into(),
                queue: "clients".into(),
            }
            .kind(),
            ErrorKind::DuplicateRegistration
        );
        assert_eq!(
            MessagingError::RestartsExhausted { attempts: 5 }.kind(),
            ErrorKind::RestartsExhausted
        );
    }

    #[test]
    fn test_retryable() {
        assert!(MessagingError::connection("gone").is_retryable());
        let handler = MessagingError::Handler {
            handler: "Audit".into(),
            queue: "clients".into(),
            source: HandlerError::failed("db down"),
        };
        assert!(handler.is_retryable());
        assert!(!MessagingError::InvalidTopology("no queues".into()).is_retryable());
        assert!(!MessagingError::RestartsExhausted { attempts: 5 }.is_retryable());
    }

    #[test]
    fn test_handler_error_source_chain() {
        let io = std::io::Error::other("disk full");
        let err = HandlerError::with_source("could not persist", io);
        assert_eq!(err.to_string(), "could not persist");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("disk full"));
        assert_eq!(err.label(), "failed");
    }

    #[test]
    fn test_kind_labels() {
        let label: &str = ErrorKind::DuplicateRegistration.as_ref();
        assert_eq!(label, "duplicate_registration");
        assert_eq!(ErrorKind::Connection.to_string(), "connection");
    }
}

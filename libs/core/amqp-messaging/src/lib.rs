//! AMQP Messaging
//!
//! A thin layer over an AMQP 0-9-1 broker for services that exchange JSON payloads.
//!
//! ## Features
//!
//! - **Shared connection**: one reference-counted broker connection per process
//! - **Topology cache**: each queue, exchange and binding set is declared once
//! - **Typed publish**: payloads go to a queue named after their type, or to a
//!   fanout, direct or topic exchange
//! - **Consumer registry**: at most one live consumer per (payload type, queue),
//!   fail-fast on the first handler error
//! - **Supervisor**: restarts a failed consumer with a bounded number of attempts
//! - **Prometheus metrics**: publish, delivery and handler counters
//!
//! ## Example
//!
//! ```ignore
//! use amqp_messaging::{AmqpConnector, ConnectionManager, MessageService};
//!
//! let connections = ConnectionManager::new(Arc::new(AmqpConnector::from_config(&config)));
//! let service = MessageService::new(connections);
//!
//! service.publish(client, Some("client_inserted")).await??;
//! service
//!     .register_consume::<Client, _>(FarewellHandler, Some("client_deleted"), true, 0)
//!     .await?;
//! ```

mod config;
mod connection;
mod consumer;
mod error;
pub mod metrics;
mod publisher;
mod registry;
mod service;
mod supervisor;
mod topology;
pub mod transport;

// Re-export main types
pub use config::{ConsumeOptions, SupervisorConfig};
pub use connection::{ChannelLease, ConnectionLease, ConnectionManager, ConnectionStats};
pub use consumer::{ConsumerRegistry, ConsumerState, SessionOutcome};
pub use error::{ErrorKind, HandlerError, MessagingError};
pub use metrics::{init_metrics, render_metrics, MessagingMetrics};
pub use publisher::{Destination, Publisher};
pub use registry::{handler_fn, short_type_name, FnHandler, Message, MessageHandler};
pub use service::{ErrorPolicy, MessageService};
pub use supervisor::Supervisor;
pub use topology::{parse_binding_keys, ExchangeKind, RoutingTable, TopologyCache, TopologyKey};
pub use transport::{AmqpConnector, BrokerStats, Delivery, InMemoryBroker};

// Re-export for handler implementations
pub use async_trait::async_trait;

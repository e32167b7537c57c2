//! Client domain record
//!
//! The payload published when clients are inserted or deleted, plus the queue
//! names those events travel on.

mod models;

pub use models::Client;

/// Queues carrying client lifecycle events
pub mod routing_keys {
    pub const CLIENT_INSERTED: &str = "client_inserted";
    pub const CLIENT_DELETED: &str = "client_deleted";
}

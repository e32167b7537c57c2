//! Shared, reference-counted broker connection
//!
//! Every publisher and consumer in the process shares at most one physical
//! connection. The first [`ConnectionManager::acquire`] opens it and the release
//! of the last [`ConnectionLease`] closes it. Channels are cheap and are opened per
//! operation through [`ChannelLease`].

use crate::error::MessagingError;
use crate::metrics::MessagingMetrics;
use crate::transport::{BrokerChannel, BrokerConnection, Connector};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Snapshot of connection lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub opened: u64,
    pub closed: u64,
    /// Leases currently outstanding
    pub references: usize,
}

#[derive(Default)]
struct Shared {
    references: usize,
    generation: u64,
    current: Option<Arc<dyn BrokerConnection>>,
    opened: u64,
    closed: u64,
}

/// Owner of the process-wide broker connection
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    /// Serialises the slow path that opens a connection
    connect_lock: AsyncMutex<()>,
    metrics: MessagingMetrics,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            shared: Mutex::new(Shared::default()),
            connect_lock: AsyncMutex::new(()),
            metrics: MessagingMetrics::new("connection"),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> ConnectionStats {
        let shared = self.lock();
        ConnectionStats {
            opened: shared.opened,
            closed: shared.closed,
            references: shared.references,
        }
    }

    /// Whether a physical connection is currently open
    pub fn is_connected(&self) -> bool {
        self.lock().current.as_ref().is_some_and(|c| c.is_open())
    }

    /// Take a reference to the shared connection, opening it if none is live.
    ///
    /// A failed connect leaves the reference count untouched.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConnectionLease, MessagingError> {
        if let Some(lease) = self.try_share() {
            return Ok(lease);
        }

        let _opening = self.connect_lock.lock().await;
        if let Some(lease) = self.try_share() {
            return Ok(lease);
        }

        let connection = self.connector.connect().await.map_err(|e| {
            warn!(target_uri = %self.connector.describe(), error = %e, "Broker connection failed");
            e
        })?;

        let (generation, retired) = {
            let mut shared = self.lock();
            let retired = shared.current.take();
            shared.generation += 1;
            shared.references = 1;
            shared.current = Some(connection.clone());
            shared.opened += 1;
            if retired.is_some() {
                shared.closed += 1;
            }
            (shared.generation, retired)
        };

        if let Some(dead) = retired {
            // Lost while leases were outstanding; those leases now release nothing
            warn!("Replacing broker connection that was lost");
            self.metrics.connection_closed();
            if let Err(e) = dead.close().await {
                debug!(error = %e, "Closing lost connection failed");
            }
        }

        info!(target_uri = %self.connector.describe(), generation, "Broker connection opened");
        self.metrics.connection_opened();

        Ok(ConnectionLease {
            manager: Arc::clone(self),
            connection,
            generation,
            released: false,
        })
    }

    /// Open a channel on the shared connection.
    ///
    /// The returned lease holds a connection reference until it is closed or dropped.
    pub async fn open_channel(self: &Arc<Self>) -> Result<ChannelLease, MessagingError> {
        let lease = self.acquire().await?;
        match lease.connection.open_channel().await {
            Ok(channel) => Ok(ChannelLease {
                channel: Some(channel),
                lease: Some(lease),
            }),
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    fn try_share(self: &Arc<Self>) -> Option<ConnectionLease> {
        let mut shared = self.lock();
        if shared.references == 0 {
            return None;
        }
        let connection = shared.current.as_ref().filter(|c| c.is_open())?.clone();
        shared.references += 1;
        Some(ConnectionLease {
            manager: Arc::clone(self),
            connection,
            generation: shared.generation,
            released: false,
        })
    }

    /// Drop one reference; hands back the connection when it was the last one.
    fn release_reference(&self, generation: u64) -> Option<Arc<dyn BrokerConnection>> {
        let mut shared = self.lock();
        if shared.generation != generation || shared.references == 0 {
            return None;
        }
        shared.references -= 1;
        if shared.references > 0 {
            return None;
        }
        let connection = shared.current.take()?;
        shared.closed += 1;
        Some(connection)
    }

    async fn close_connection(&self, connection: Arc<dyn BrokerConnection>) {
        self.metrics.connection_closed();
        match connection.close().await {
            Ok(()) => info!("Broker connection closed"),
            Err(e) => warn!(error = %e, "Error while closing broker connection"),
        }
    }
}

/// One reference to the shared connection
///
/// Release it with [`release`](Self::release) to close deterministically; dropping
/// it releases on a background task.
pub struct ConnectionLease {
    manager: Arc<ConnectionManager>,
    connection: Arc<dyn BrokerConnection>,
    generation: u64,
    released: bool,
}

impl ConnectionLease {
    pub fn connection(&self) -> &dyn BrokerConnection {
        self.connection.as_ref()
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Some(connection) = self.manager.release_reference(self.generation) {
            self.manager.close_connection(connection).await;
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(connection) = self.manager.release_reference(self.generation) else {
            return;
        };
        let manager = Arc::clone(&self.manager);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { manager.close_connection(connection).await });
            }
            Err(_) => warn!("No runtime available, broker connection dropped without close"),
        }
    }
}

/// A channel plus the connection reference keeping it alive
pub struct ChannelLease {
    channel: Option<Box<dyn BrokerChannel>>,
    lease: Option<ConnectionLease>,
}

impl ChannelLease {
    /// Close the channel, then release the connection reference.
    pub async fn close(mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Channel close failed");
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("channel is only taken by close()"),
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let (Some(channel), lease) = (self.channel.take(), self.lease.take()) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = channel.close().await;
                    if let Some(lease) = lease {
                        lease.release().await;
                    }
                });
            }
            // lease drop still releases the reference
            Err(_) => drop(lease),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_shares_one_connection() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.connector());

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert_eq!(manager.stats().references, 2);
        assert_eq!(broker.stats().connections_opened, 1);

        first.release().await;
        assert!(manager.is_connected());
        second.release().await;

        assert!(!manager.is_connected());
        assert_eq!(
            manager.stats(),
            ConnectionStats {
                opened: 1,
                closed: 1,
                references: 0
            }
        );
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_full_release() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.connector());

        manager.acquire().await.unwrap().release().await;
        manager.acquire().await.unwrap().release().await;

        assert_eq!(broker.stats().connections_opened, 2);
        assert_eq!(broker.stats().connections_closed, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_count_untouched() {
        let broker = InMemoryBroker::new();
        broker.set_refuse_connections(true);
        let manager = ConnectionManager::new(broker.connector());

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, MessagingError::Connection(_)));
        assert_eq!(manager.stats(), ConnectionStats::default());
    }

    #[tokio::test]
    async fn test_dropped_lease_closes_in_background() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.connector());

        let lease = manager.acquire().await.unwrap();
        drop(lease);

        for _ in 0..50 {
            if broker.open_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(manager.stats().references, 0);
    }

    #[tokio::test]
    async fn test_lost_connection_is_replaced() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.connector());

        let stale = manager.acquire().await.unwrap();
        broker.disconnect_all();

        let fresh = manager.acquire().await.unwrap();
        assert!(fresh.connection().is_open());
        assert_eq!(broker.stats().connections_opened, 2);

        // the stale lease belongs to the retired connection
        stale.release().await;
        assert!(manager.is_connected());

        fresh.release().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.stats().references, 0);
    }

    #[tokio::test]
    async fn test_channel_lease_releases_connection() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.connector());

        let channel = manager.open_channel().await.unwrap();
        channel.declare_queue("clients").await.unwrap();
        assert_eq!(broker.open_channels(), 1);

        channel.close().await;
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.open_connections(), 0);
    }
}

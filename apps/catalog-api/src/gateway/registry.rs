//! Membership set of live realtime connections and best-effort fan-out.

use std::sync::Arc;
use std::time::Duration;

use catalog_common::id::prefix;
use catalog_common::PrefixedId;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant};

use super::events::OutboundMessage;

/// Frames queued per connection before it is considered stalled.
pub const OUTBOX_CAPACITY: usize = 64;

/// The registry's handle onto one client.
///
/// The delivery loop owns the socket; the registry only holds the sending
/// half of the connection's outbox. Dropping the last handle closes the
/// outbox, which ends the delivery loop's writer.
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    outbox: mpsc::Sender<Arc<str>>,
}

impl PrefixedId for Connection {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl Connection {
    pub fn new(outbox: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id: Self::generate(),
            outbox,
        }
    }

    /// A new connection handle and the receiving end of its outbox.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Shared registry of every connection eligible for broadcasts.
///
/// Uses `DashMap` so register/deregister from per-connection tasks never
/// contend on a single lock with an in-flight broadcast.
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn register(&self, conn: Connection) {
        let conn_id = conn.id.clone();
        self.connections.insert(conn_id.clone(), conn);
        tracing::info!(%conn_id, total = self.connections.len(), "realtime connection registered");
    }

    /// Remove a connection. Absent ids are ignored.
    pub fn deregister(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            tracing::info!(%conn_id, total = self.connections.len(), "realtime connection removed");
        }
    }

    /// Queue `message` on every registered connection.
    ///
    /// The message is serialized once and membership is snapshotted before
    /// iterating. A connection whose outbox is closed or full is removed;
    /// the others are unaffected. Returns the number of connections the
    /// frame was queued for.
    pub fn broadcast(&self, message: &OutboundMessage) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, kind = message.kind(), "failed to encode broadcast");
                return 0;
            }
        };

        let snapshot: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        if snapshot.is_empty() {
            tracing::debug!(kind = message.kind(), "no realtime connections to broadcast to");
            return 0;
        }

        let mut delivered = 0;
        for conn in snapshot {
            match conn.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(conn_id = %conn.id, "outbox full, dropping stalled connection");
                    self.deregister(&conn.id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(conn_id = %conn.id, "outbox closed during broadcast");
                    self.deregister(&conn.id);
                }
            }
        }

        tracing::info!(kind = message.kind(), recipients = delivered, "broadcast queued");
        delivered
    }

    /// Current membership size. Observability only.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Wait for every delivery loop to deregister. Returns `false` if
    /// connections remain once `timeout` has passed.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.connections.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage::connection_established()
    }

    #[test]
    fn register_increases_count() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = Connection::channel(4);
        let (b, _rx_b) = Connection::channel(4);
        assert_ne!(a.id(), b.id());

        registry.register(a);
        registry.register(b);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = Connection::channel(4);
        let id = conn.id().to_string();
        registry.register(conn);

        registry.deregister(&id);
        registry.deregister(&id);
        registry.deregister("conn_never_registered");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn broadcast_isolates_failing_connection() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (conn, rx) = Connection::channel(4);
            registry.register(conn);
            receivers.push(rx);
        }

        let (broken, broken_rx) = Connection::channel(4);
        let broken_id = broken.id().to_string();
        registry.register(broken);
        drop(broken_rx);

        let delivered = registry.broadcast(&message());
        assert_eq!(delivered, 4);
        assert_eq!(registry.count(), 4);
        assert!(registry.connections.get(&broken_id).is_none());

        for rx in &mut receivers {
            let frame = rx.recv().await.unwrap();
            assert!(frame.contains("CONNECTION_ESTABLISHED"));
        }
    }

    #[test]
    fn broadcast_drops_stalled_connection() {
        let registry = ConnectionRegistry::new();
        let (slow, _slow_rx) = Connection::channel(1);
        let (fast, mut fast_rx) = Connection::channel(8);
        registry.register(slow);
        registry.register(fast);

        assert_eq!(registry.broadcast(&message()), 2);
        // The slow outbox is now full; the next frame evicts it.
        assert_eq!(registry.broadcast(&message()), 1);
        assert_eq!(registry.count(), 1);

        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn broadcast_with_no_connections_is_noop() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.broadcast(&message()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn register_during_broadcast_does_not_fail() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut keep = Vec::new();
        for _ in 0..32 {
            let (conn, rx) = Connection::channel(OUTBOX_CAPACITY);
            registry.register(conn);
            keep.push(rx);
        }

        let registrar = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut late = Vec::new();
                for _ in 0..32 {
                    let (conn, rx) = Connection::channel(OUTBOX_CAPACITY);
                    registry.register(conn);
                    late.push(rx);
                    tokio::task::yield_now().await;
                }
                late
            })
        };

        for _ in 0..16 {
            let delivered = registry.broadcast(&message());
            assert!(delivered >= 32);
            tokio::task::yield_now().await;
        }

        let late = registrar.await.unwrap();
        assert_eq!(registry.count(), 32 + late.len());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_empty_tracks_deregistration() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(registry.wait_until_empty(Duration::ZERO).await);

        let (conn, _rx) = Connection::channel(4);
        let id = conn.id().to_string();
        registry.register(conn);
        assert!(!registry.wait_until_empty(Duration::from_millis(100)).await);

        let closer = registry.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            closer.deregister(&id);
        });
        assert!(registry.wait_until_empty(Duration::from_secs(1)).await);
    }
}

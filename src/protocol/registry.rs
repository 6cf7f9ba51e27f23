//! Connection registry
//!
//! Maps connection ids to the write side of live TCP sockets. The registry is
//! the only owner of those write halves: removing an entry signals the
//! connection's forwarding reader to stop and drops the writer, which closes
//! the socket. Each socket is therefore closed exactly once, by whichever of
//! local EOF or a remote ClosePort happens first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::protocol::ids::IdGenerator;
use crate::utils::Metrics;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to one tunneled connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            closed: CancellationToken::new(),
        }
    }

    /// Write all of `bytes` to the local socket.
    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Token cancelled once the connection has been removed from the registry
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Thread-safe connection id → socket table.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u32, ConnectionHandle>>,
    ids: IdGenerator,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(),
            metrics,
        }
    }

    /// Fresh connection id, unique for the lifetime of this registry
    pub fn next_connection_id(&self) -> u32 {
        self.ids.next_id()
    }

    /// Register a live connection. An id may be present at most once.
    pub fn register(&self, id: u32, handle: ConnectionHandle) -> Result<()> {
        {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if connections.contains_key(&id) {
                return Err(TunnelError::DuplicateConnection(id));
            }
            connections.insert(id, handle);
        }

        self.metrics.connection_opened();
        debug!(connection_id = id, "Connection registered");
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Option<ConnectionHandle> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Remove and close a connection. Returns false if it was not registered.
    pub fn remove(&self, id: u32) -> bool {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match removed {
            Some(handle) => {
                handle.closed.cancel();
                self.metrics.connection_closed();
                debug!(connection_id = id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Close every registered connection; used on shutdown.
    /// Returns the ids that were closed, in ascending order.
    pub fn close_all(&self) -> Vec<u32> {
        let drained: Vec<(u32, ConnectionHandle)> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut ids = Vec::with_capacity(drained.len());
        for (id, handle) in drained {
            handle.closed.cancel();
            self.metrics.connection_closed();
            ids.push(id);
        }
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tokio::io::AsyncReadExt;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(Metrics::new()))
    }

    #[test]
    fn ids_are_monotonic() {
        let registry = registry();
        let a = registry.next_connection_id();
        let b = registry.next_connection_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let registry = registry();
        let (local, _remote) = tokio::io::duplex(64);
        let handle = ConnectionHandle::new(local);
        let closed = handle.closed();

        registry.register(7, handle).unwrap();
        assert!(registry.contains(7));
        assert!(registry.lookup(7).is_some());
        assert!(registry.lookup(8).is_none());

        assert!(registry.remove(7));
        assert!(closed.is_cancelled());
        assert!(!registry.remove(7));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = registry();
        let (a, _a_peer) = tokio::io::duplex(8);
        let (b, _b_peer) = tokio::io::duplex(8);

        registry.register(1, ConnectionHandle::new(a)).unwrap();
        assert!(matches!(
            registry.register(1, ConnectionHandle::new(b)),
            Err(TunnelError::DuplicateConnection(1))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn writes_reach_the_socket() {
        let registry = registry();
        let (local, mut remote) = tokio::io::duplex(64);
        registry.register(3, ConnectionHandle::new(local)).unwrap();

        registry.lookup(3).unwrap().write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn removal_closes_the_socket() {
        let registry = registry();
        let (local, mut remote) = tokio::io::duplex(64);
        registry.register(4, ConnectionHandle::new(local)).unwrap();

        registry.remove(4);

        let mut buf = Vec::new();
        let n = remote.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn close_all_drains_everything() {
        let metrics = Arc::new(Metrics::new());
        let registry = ConnectionRegistry::new(metrics.clone());
        let mut peers = Vec::new();
        for id in 1..=3 {
            let (local, remote) = tokio::io::duplex(8);
            peers.push(remote);
            registry.register(id, ConnectionHandle::new(local)).unwrap();
        }

        assert_eq!(registry.close_all(), vec![1, 2, 3]);
        assert!(registry.is_empty());
        assert_eq!(metrics.connections_active(), 0);
    }
}

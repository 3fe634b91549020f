//! Live connection registry.
//!
//! Maps each identity to the one connection currently allowed to receive its
//! live frames. The newest connection for an identity always wins; an older
//! connection closing later must not evict it, which is why removal is keyed
//! by connection id as well as identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

/// Outgoing half of one connection's writer queue.
pub type FrameSender = mpsc::UnboundedSender<String>;
pub type FrameReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub sender: FrameSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The recipient has no live connection, or its writer has gone away.
    Miss,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    next_conn_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh connection id and writer queue.
    pub fn channel(&self) -> (ConnectionHandle, FrameReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        (ConnectionHandle { conn_id, sender }, receiver)
    }

    /// Bind `identity` to `handle`, returning the connection id it replaced.
    pub async fn register(&self, identity: &str, handle: ConnectionHandle) -> Option<u64> {
        let mut connections = self.connections.write().await;
        connections
            .insert(identity.to_string(), handle)
            .map(|previous| previous.conn_id)
    }

    /// Remove `identity` only if it is still bound to `conn_id`.
    pub async fn unregister(&self, identity: &str, conn_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(identity) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub async fn deliver(&self, identity: &str, frame: String) -> DeliveryOutcome {
        let connections = self.connections.read().await;
        match connections.get(identity) {
            Some(handle) if handle.sender.send(frame).is_ok() => DeliveryOutcome::Delivered,
            _ => DeliveryOutcome::Miss,
        }
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        self.connections.read().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

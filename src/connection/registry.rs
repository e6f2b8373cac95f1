//! Registry of live connections, keyed by peer address.
//!
//! `listen` registers each connection here; the entry is removed when the
//! stream ends, the keep-alive times out, or the connection is destroyed.
//! Removal is idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use super::Connection;

/// Peer-address-keyed map of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, conn: Connection) {
        let peer = conn.peer();
        let mut map = self.connections.lock().expect("registry poisoned");
        if map.insert(peer, conn).is_some() {
            tracing::warn!(%peer, "replacing existing registry entry");
        }
    }

    /// Remove a connection entry. Safe to call more than once.
    pub(crate) fn remove(&self, peer: &SocketAddr) {
        let mut map = self.connections.lock().expect("registry poisoned");
        map.remove(peer);
    }

    /// Look up a live connection by peer address.
    pub fn get(&self, peer: &SocketAddr) -> Option<Connection> {
        let map = self.connections.lock().expect("registry poisoned");
        map.get(peer).cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Peer registry: the connections this node currently replicates to.
//! Keyed on the peer's remote address string.

use std::sync::Arc;

use dashmap::DashMap;

use crate::transport::Peer;

/// Shared between the transport hooks, the dispatch loop and
/// `store`/`get`. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`, replacing any earlier connection from the same
    /// address.
    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.id(), peer);
    }

    /// Remove `peer`, but only if the registered entry is this very
    /// connection. A stale disconnect must not evict a newer one.
    pub fn remove(&self, peer: &Peer) -> bool {
        self.peers
            .remove_if(&peer.id(), |_, registered| std::ptr::eq(Arc::as_ptr(registered), peer))
            .is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    /// Point-in-time copy, safe to hold across `.await`.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

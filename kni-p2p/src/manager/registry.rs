//! Table of active peers.

use std::collections::BTreeMap;

use kni_core::NodeId;
use tokio::sync::RwLock;

use crate::address::PeerDescriptor;
use crate::error::{P2pError, P2pResult};
use crate::peer::{PeerHandle, PeerInfo};

/// Active peers keyed by identity.
///
/// Adds, removals and snapshots are serialized by one lock, so a snapshot
/// never sees a half-applied change.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<NodeId, PeerHandle>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. Returns `false`, changing nothing, if its identity is
    /// already present.
    pub async fn add(&self, handle: PeerHandle) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&handle.id()) {
            return false;
        }
        peers.insert(handle.id(), handle);
        true
    }

    /// Insert a peer if it is new and the table holds fewer than `max_peers`.
    pub async fn try_add(&self, handle: PeerHandle, max_peers: usize) -> P2pResult<()> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&handle.id()) {
            return Err(P2pError::DuplicatePeer(handle.id()));
        }
        if peers.len() >= max_peers {
            return Err(P2pError::TooManyPeers { max: max_peers });
        }
        peers.insert(handle.id(), handle);
        Ok(())
    }

    /// Remove a peer. Removing an absent identity is a no-op.
    pub async fn remove(&self, id: &NodeId) -> Option<PeerHandle> {
        self.peers.write().await.remove(id)
    }

    /// Point-in-time copy of every peer, ordered by identity.
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .map(|handle| handle.info().clone())
            .collect()
    }

    /// Descriptors of every peer, ordered by identity.
    pub async fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.peers
            .read()
            .await
            .values()
            .map(|handle| handle.descriptor().clone())
            .collect()
    }

    /// Handles of every peer, ordered by identity.
    pub async fn handles(&self) -> Vec<PeerHandle> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Handle for one peer.
    pub async fn get(&self, id: &NodeId) -> Option<PeerHandle> {
        self.peers.read().await.get(id).cloned()
    }

    /// Check if a peer is present.
    pub async fn contains(&self, id: &NodeId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Number of peers.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Check if there are no peers.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

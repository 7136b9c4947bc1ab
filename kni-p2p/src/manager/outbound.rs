//! Outbound connections.

use std::sync::Arc;

use kni_core::NodeId;
use tokio::time::{interval, MissedTickBehavior};

use crate::address::PeerDescriptor;
use crate::error::{P2pError, P2pResult};
use crate::manager::PeerManager;
use crate::peer::Session;

/// Marks an identity as being dialed until dropped.
struct DialGuard<'a> {
    manager: &'a PeerManager,
    id: NodeId,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.manager.dialing().remove(&self.id);
    }
}

impl PeerManager {
    /// Dial a peer, handshake and activate it.
    ///
    /// Fails fast when the identity is our own, already connected or being
    /// dialed, or when the peer table is full.
    pub async fn dial(self: &Arc<Self>, descriptor: &PeerDescriptor) -> P2pResult<()> {
        let work = self.dial_inner(descriptor);
        self.tracker.track_future(work).await
    }

    async fn dial_inner(self: &Arc<Self>, descriptor: &PeerDescriptor) -> P2pResult<()> {
        if self.is_shutting_down() {
            return Err(P2pError::NotRunning);
        }

        let id = descriptor.id;
        if id == self.local().id() {
            return Err(P2pError::SelfDial);
        }
        if self.peers().contains(&id).await {
            return Err(P2pError::DuplicatePeer(id));
        }
        let max = self.config().max_peers;
        if self.peers().len().await >= max {
            return Err(P2pError::TooManyPeers { max });
        }

        if !self.dialing().insert(id) {
            return Err(P2pError::DuplicatePeer(id));
        }
        let _guard = DialGuard {
            manager: self.as_ref(),
            id,
        };

        let session = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(P2pError::NotRunning),
            result = Session::open(descriptor, self.local(), self.timeouts()) => result?,
        };

        self.activate(session).await
    }

    /// Add a peer to the static set and dial it in the background.
    pub fn add_static_peer(self: &Arc<Self>, descriptor: PeerDescriptor) {
        self.static_peers().insert(descriptor.id, descriptor.clone());
        self.spawn_dial(descriptor);
    }

    /// Dial in a background task, logging the outcome.
    pub fn spawn_dial(self: &Arc<Self>, descriptor: PeerDescriptor) {
        let manager = self.clone();
        self.spawn(async move {
            match manager.dial_inner(&descriptor).await {
                Ok(()) => {}
                Err(P2pError::DuplicatePeer(_)) | Err(P2pError::NotRunning) => {}
                Err(e) => {
                    tracing::debug!(peer = %descriptor.id.short(), addr = %descriptor.transport_addr(), error = %e, "Dial failed");
                }
            }
        });
    }

    /// Static peers that are neither connected nor being dialed.
    async fn static_peers_to_dial(&self) -> Vec<PeerDescriptor> {
        let candidates: Vec<PeerDescriptor> = self.static_peers().values().cloned().collect();
        let mut missing = Vec::new();
        for descriptor in candidates {
            if self.dialing().contains(&descriptor.id) {
                continue;
            }
            if !self.peers().contains(&descriptor.id).await {
                missing.push(descriptor);
            }
        }
        missing
    }
}

/// Keep static peers connected: dial them now and re-dial every
/// `static_redial_interval` while they are disconnected.
pub async fn run_static_dialer(manager: Arc<PeerManager>) {
    let shutdown = manager.shutdown.clone();
    let mut ticker = interval(manager.config().static_redial_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for descriptor in manager.static_peers_to_dial().await {
                    tracing::debug!(peer = %descriptor.id.short(), "Dialing static peer");
                    manager.spawn_dial(descriptor);
                }
            }
        }
    }
}

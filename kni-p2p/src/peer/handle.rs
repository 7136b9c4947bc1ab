//! Handle to an active peer.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use kni_core::NodeId;
use tokio_util::sync::CancellationToken;

use crate::address::PeerDescriptor;
use crate::error::P2pResult;
use crate::peer::{PeerInfo, PeerState, Session};
use crate::protocol::{Capability, Message};

/// Cloneable handle to an active peer.
///
/// Handed to protocol handlers and kept in the peer registry. Dropping a
/// handle does not close the session.
#[derive(Clone)]
pub struct PeerHandle {
    info: Arc<PeerInfo>,
    session: Arc<Session>,
    cancel: CancellationToken,
    state: Arc<Mutex<PeerState>>,
}

impl PeerHandle {
    pub(crate) fn new(session: Arc<Session>, cancel: CancellationToken) -> Self {
        Self {
            info: Arc::new(session.info()),
            session,
            cancel,
            state: Arc::new(Mutex::new(PeerState::Connecting)),
        }
    }

    /// Identity of the peer.
    pub fn id(&self) -> NodeId {
        self.info.id()
    }

    /// Where the peer can be reached.
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.info.descriptor
    }

    /// Snapshot taken when the peer became active.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Negotiated capability for `name`.
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.info.capability(name)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a message of a negotiated protocol.
    pub async fn send(
        &self,
        protocol: impl Into<String>,
        code: u64,
        payload: impl Into<Bytes>,
    ) -> P2pResult<()> {
        self.session
            .write_message(Message::new(protocol, code, payload))
            .await
    }

    /// Ask the peer's task to disconnect it.
    ///
    /// Returns immediately; the Dropped event follows once the task is done.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `next`, ignoring illegal steps.
    pub(crate) fn transition_to(&self, next: PeerState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(next) {
            tracing::warn!(peer = %self.id().short(), from = %*state, to = %next, "Illegal peer state transition");
            return false;
        }
        tracing::debug!(peer = %self.id().short(), from = %*state, to = %next, "Peer state transition");
        *state = next;
        true
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("peer", &self.info.descriptor.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::session::testing::{local_node, session_pair};
    use crate::protocol::ProtocolDescriptor;

    #[tokio::test]
    async fn test_handle_send_and_state() {
        let a = local_node(vec![ProtocolDescriptor::new("foo", 1, 4)]);
        let b = local_node(vec![ProtocolDescriptor::new("foo", 1, 4)]);
        let (outbound, inbound) = session_pair(&a, &b).await;
        let (outbound, inbound) = (Arc::new(outbound.unwrap()), inbound.unwrap());

        let handle = PeerHandle::new(outbound, CancellationToken::new());
        assert_eq!(handle.id(), b.id());
        assert_eq!(handle.state(), PeerState::Connecting);

        assert!(handle.transition_to(PeerState::Active));
        assert!(!handle.transition_to(PeerState::Connecting));
        assert_eq!(handle.state(), PeerState::Active);

        handle.send("foo", 2, vec![9u8]).await.unwrap();
        let msg = inbound.read_message().await.unwrap();
        assert_eq!((msg.code, &msg.payload[..]), (2, &[9u8][..]));
    }

    #[tokio::test]
    async fn test_disconnect_cancels() {
        let a = local_node(vec![ProtocolDescriptor::new("foo", 1, 4)]);
        let b = local_node(vec![ProtocolDescriptor::new("foo", 1, 4)]);
        let (outbound, _inbound) = session_pair(&a, &b).await;

        let cancel = CancellationToken::new();
        let handle = PeerHandle::new(Arc::new(outbound.unwrap()), cancel.clone());
        handle.clone().disconnect();
        assert!(cancel.is_cancelled());
    }
}

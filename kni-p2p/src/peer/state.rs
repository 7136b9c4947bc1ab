//! Peer lifecycle state machine.

use std::fmt;

/// Lifecycle of one peer.
///
/// `Connecting -> Active -> Disconnecting -> Closed`. A peer whose
/// handshake yields no common protocol skips `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Dialing or handshaking.
    #[default]
    Connecting,
    /// Registered and dispatching messages.
    Active,
    /// Tearing down the session.
    Disconnecting,
    /// Transport released and registry entry removed.
    Closed,
}

impl PeerState {
    /// Check if the peer is dispatching messages.
    pub fn is_active(&self) -> bool {
        matches!(self, PeerState::Active)
    }

    /// Check if the peer is disconnecting or already closed.
    pub fn is_terminating(&self) -> bool {
        matches!(self, PeerState::Disconnecting | PeerState::Closed)
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(&self, next: PeerState) -> bool {
        matches!(
            (self, next),
            (PeerState::Connecting, PeerState::Active)
                | (PeerState::Connecting, PeerState::Disconnecting)
                | (PeerState::Active, PeerState::Disconnecting)
                | (PeerState::Disconnecting, PeerState::Closed)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Active => write!(f, "active"),
            PeerState::Disconnecting => write!(f, "disconnecting"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

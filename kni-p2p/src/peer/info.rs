//! Peer information snapshots.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use kni_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::address::PeerDescriptor;
use crate::protocol::Capability;

/// Direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// Peer connected to us.
    Inbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

/// Point-in-time view of a connected peer.
///
/// Plain data: holding one does not keep the session alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Where the peer can be reached.
    pub descriptor: PeerDescriptor,
    /// Socket address of the live connection.
    pub remote_addr: SocketAddr,
    /// Direction of the connection.
    pub direction: ConnectionDirection,
    /// Negotiated protocols, ordered by name.
    pub capabilities: Vec<Capability>,
    /// When the session became active.
    pub connected_since: SystemTime,
    /// Peer's user agent.
    pub user_agent: String,
}

impl PeerInfo {
    /// Identity of the peer.
    pub fn id(&self) -> NodeId {
        self.descriptor.id
    }

    /// Check if this is an outbound connection.
    pub fn is_outbound(&self) -> bool {
        self.direction == ConnectionDirection::Outbound
    }

    /// Check if this is an inbound connection.
    pub fn is_inbound(&self) -> bool {
        self.direction == ConnectionDirection::Inbound
    }

    /// Negotiated capability for `name`, if any.
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// How long the session has been active.
    pub fn connection_duration(&self) -> Duration {
        self.connected_since.elapsed().unwrap_or_default()
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, [",
            self.descriptor.id.short(),
            self.remote_addr,
            self.direction
        )?;
        for (i, cap) in self.capabilities.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", cap)?;
        }
        write!(f, "])")
    }
}

//! Wire frames.
//!
//! A session carries five control frames plus multiplexed protocol
//! messages. Control frames never reach protocol handlers.

use std::fmt;

use bytes::Bytes;
use kni_core::{NodeId, Signature};
use serde::{Deserialize, Serialize};

use crate::address::NodeRole;
use crate::protocol::ProtocolDescriptor;

/// Identity and capability announcement, sent first by both sides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloMessage {
    /// Sender's public identity.
    pub node_id: NodeId,
    /// Every protocol version the sender speaks.
    pub protocols: Vec<ProtocolDescriptor>,
    /// Port the sender accepts connections on (0 if none).
    pub listen_port: u16,
    /// Sender's advertised role.
    pub role: Option<NodeRole>,
    /// User agent string.
    pub user_agent: String,
    /// Random challenge the receiver must sign.
    pub challenge: [u8; 32],
    /// Unix timestamp when the message was created.
    pub timestamp: u64,
}

/// Proof of identity: a signature over the peer's challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthMessage {
    /// Signature over the auth transcript.
    pub signature: Signature,
}

/// A message of one negotiated protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Name of the protocol this message belongs to.
    pub protocol: String,
    /// Message type within the protocol. Must be below the negotiated capacity.
    pub code: u64,
    /// Opaque protocol payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a protocol message.
    pub fn new(protocol: impl Into<String>, code: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol: protocol.into(),
            code,
            payload: payload.into(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({} bytes)",
            self.protocol,
            self.code,
            self.payload.len()
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Local removal request.
    Requested,
    /// The server is stopping.
    Shutdown,
    /// Read or write failed.
    NetworkError,
    /// The remote broke the negotiated protocol rules.
    ProtocolViolation,
    /// Nothing was received within the idle timeout.
    IdleTimeout,
    /// A protocol handler returned an error.
    HandlerError,
    /// A session with this identity already exists.
    AlreadyConnected,
    /// The peer limit is reached.
    TooManyPeers,
    /// No protocol could be negotiated.
    UselessPeer,
    /// The remote presented our own identity.
    SelfConnection,
    /// The remote announced a disconnect with this reason.
    RemoteRequested(Box<DisconnectReason>),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "disconnect requested"),
            DisconnectReason::Shutdown => write!(f, "server shutting down"),
            DisconnectReason::NetworkError => write!(f, "network error"),
            DisconnectReason::ProtocolViolation => write!(f, "protocol violation"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::HandlerError => write!(f, "protocol handler error"),
            DisconnectReason::AlreadyConnected => write!(f, "already connected"),
            DisconnectReason::TooManyPeers => write!(f, "too many peers"),
            DisconnectReason::UselessPeer => write!(f, "no common protocols"),
            DisconnectReason::SelfConnection => write!(f, "connected to self"),
            DisconnectReason::RemoteRequested(inner) => write!(f, "remote: {}", inner),
        }
    }
}

/// Everything that travels over a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Identity and capability announcement.
    Hello(HelloMessage),
    /// Identity proof.
    Auth(AuthMessage),
    /// Orderly close with a reason.
    Disconnect(DisconnectReason),
    /// Keepalive with a nonce.
    Ping(u64),
    /// Keepalive answer echoing the nonce.
    Pong(u64),
    /// A negotiated protocol message.
    Protocol(Message),
}

impl Frame {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Auth(_) => "auth",
            Frame::Disconnect(_) => "disconnect",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Protocol(_) => "protocol",
        }
    }
}

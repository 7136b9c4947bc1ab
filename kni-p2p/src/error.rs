//! P2P error types.

use std::io;
use std::net::SocketAddr;

use kni_core::NodeId;
use thiserror::Error;

use crate::protocol::DisconnectReason;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// A peer locator string could not be parsed.
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    /// Outbound TCP connect did not finish in time.
    #[error("Dial timeout to {addr}")]
    DialTimeout { addr: String },

    /// Outbound TCP connect failed.
    #[error("Connection refused by {addr}: {reason}")]
    ConnectionRefused { addr: String, reason: String },

    /// Identity handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A session with this identity is already active.
    #[error("Peer already connected: {0}")]
    DuplicatePeer(NodeId),

    /// Handshake succeeded but no protocol could be agreed on.
    #[error("No common protocols with peer {0}")]
    NoCommonProtocols(NodeId),

    /// The remote sent something the negotiated protocols do not allow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The session is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote announced that it is closing the session.
    #[error("Remote disconnected: {0}")]
    RemoteDisconnect(DisconnectReason),

    /// Nothing was received within the idle timeout.
    #[error("Read timeout")]
    Timeout,

    /// A frame could not be written within the write timeout.
    #[error("Write timeout")]
    WriteTimeout,

    /// The listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a frame.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame exceeds the maximum allowed size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Invalid network magic bytes.
    #[error("Invalid network magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// A protocol registration was rejected.
    #[error("Invalid protocol {name}: {reason}")]
    InvalidProtocol { name: String, reason: String },

    /// The peer limit is reached.
    #[error("Too many peers (max: {max})")]
    TooManyPeers { max: usize },

    /// Refusing to dial our own identity.
    #[error("Refusing to dial self")]
    SelfDial,

    /// No peer with this identity is connected.
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),

    /// A protocol handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// `start` was called on a server that is not freshly created.
    #[error("Server already started")]
    AlreadyRunning,

    /// The operation needs a running server.
    #[error("Server not running")]
    NotRunning,
}

impl From<kni_core::SerializationError> for P2pError {
    fn from(err: kni_core::SerializationError) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

impl P2pError {
    /// The disconnect cause reported when this error ends an active session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            P2pError::ProtocolViolation(_)
            | P2pError::InvalidMagic { .. }
            | P2pError::MessageTooLarge { .. }
            | P2pError::Serialization(_) => DisconnectReason::ProtocolViolation,
            P2pError::Timeout => DisconnectReason::IdleTimeout,
            P2pError::RemoteDisconnect(reason) => {
                DisconnectReason::RemoteRequested(Box::new(reason.clone()))
            }
            P2pError::Handler(_) => DisconnectReason::HandlerError,
            _ => DisconnectReason::NetworkError,
        }
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;

//! Identity handshake.
//!
//! Both sides run the same steps:
//! 1. Send `Hello` with our identity, protocols and a fresh random challenge
//! 2. Receive the peer's `Hello`
//! 3. Send `Auth`: our signature over the peer's challenge
//! 4. Receive the peer's `Auth` and verify it against the id in its `Hello`
//!
//! After step 4 the peer has proven it holds the key behind its node id.

use std::time::SystemTime;

use kni_core::{sha256_concat, KeyPair, NodeId};

use crate::address::NodeRole;
use crate::error::{P2pError, P2pResult};
use crate::protocol::{AuthMessage, HelloMessage, ProtocolDescriptor};

/// Domain separator for auth signatures.
const AUTH_DOMAIN: &[u8] = b"kni-auth-v1";

/// Digest a node signs to answer `challenge`.
///
/// Binding the signer's id into the digest stops a signature produced for
/// one identity from being replayed under another.
pub fn auth_transcript(challenge: &[u8; 32], signer: &NodeId) -> [u8; 32] {
    sha256_concat(&[AUTH_DOMAIN, challenge, signer.as_bytes()])
}

/// What the local node presents during the handshake.
#[derive(Debug, Clone)]
pub struct LocalNode {
    /// Node key.
    pub key: KeyPair,
    /// Advertised protocols.
    pub protocols: Vec<ProtocolDescriptor>,
    /// Listening port, 0 when not listening.
    pub listen_port: u16,
    /// Advertised role.
    pub role: Option<NodeRole>,
    /// User agent string.
    pub user_agent: String,
}

impl LocalNode {
    /// Our node id.
    pub fn id(&self) -> NodeId {
        self.key.node_id()
    }

    /// Build our hello for a given challenge.
    pub fn hello(&self, challenge: [u8; 32]) -> HelloMessage {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        HelloMessage {
            node_id: self.id(),
            protocols: self.protocols.clone(),
            listen_port: self.listen_port,
            role: self.role.clone(),
            user_agent: self.user_agent.clone(),
            challenge,
            timestamp,
        }
    }

    /// Answer the peer's challenge.
    pub fn auth(&self, remote_challenge: &[u8; 32]) -> AuthMessage {
        AuthMessage {
            signature: self.key.sign(&auth_transcript(remote_challenge, &self.id())),
        }
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Proven identity of the peer.
    pub node_id: NodeId,
    /// Protocols the peer advertised.
    pub protocols: Vec<ProtocolDescriptor>,
    /// Peer's listening port (0 if none).
    pub listen_port: u16,
    /// Peer's advertised role.
    pub role: Option<NodeRole>,
    /// Peer's user agent.
    pub user_agent: String,
}

impl From<HelloMessage> for HandshakeOutcome {
    fn from(msg: HelloMessage) -> Self {
        Self {
            node_id: msg.node_id,
            protocols: msg.protocols,
            listen_port: msg.listen_port,
            role: msg.role,
            user_agent: msg.user_agent,
        }
    }
}

/// Handshake state machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing sent yet.
    #[default]
    Initial,
    /// Our hello is out, waiting for the peer's.
    HelloSent { challenge: [u8; 32] },
    /// Hellos exchanged, waiting for the peer's auth.
    AwaitingAuth {
        challenge: [u8; 32],
        remote: HelloMessage,
    },
    /// Peer identity proven.
    Complete(HandshakeOutcome),
}

impl HandshakeState {
    /// Create initial handshake state.
    pub fn new() -> Self {
        Self::Initial
    }

    /// Record that our hello carrying `challenge` was sent.
    pub fn sent_hello(&mut self, challenge: [u8; 32]) -> P2pResult<()> {
        match self {
            Self::Initial => {
                *self = Self::HelloSent { challenge };
                Ok(())
            }
            _ => Err(P2pError::HandshakeFailed("hello already sent".to_string())),
        }
    }

    /// Accept the peer's hello.
    ///
    /// Rejects our own id, and any id other than `expected` when dialing a
    /// known peer.
    pub fn received_hello(
        &mut self,
        hello: HelloMessage,
        local_id: &NodeId,
        expected: Option<&NodeId>,
    ) -> P2pResult<()> {
        if &hello.node_id == local_id {
            return Err(P2pError::HandshakeFailed("connected to self".to_string()));
        }
        if let Some(expected) = expected {
            if &hello.node_id != expected {
                return Err(P2pError::HandshakeFailed(format!(
                    "identity mismatch: expected {}, got {}",
                    expected.short(),
                    hello.node_id.short()
                )));
            }
        }

        match self {
            Self::HelloSent { challenge } => {
                *self = Self::AwaitingAuth {
                    challenge: *challenge,
                    remote: hello,
                };
                Ok(())
            }
            _ => Err(P2pError::HandshakeFailed("unexpected hello".to_string())),
        }
    }

    /// Verify the peer's auth and complete the handshake.
    pub fn received_auth(&mut self, auth: &AuthMessage) -> P2pResult<()> {
        match self {
            Self::AwaitingAuth { challenge, remote } => {
                let transcript = auth_transcript(challenge, &remote.node_id);
                kni_core::verify(&remote.node_id, &transcript, &auth.signature)
                    .map_err(|e| P2pError::HandshakeFailed(format!("bad auth: {}", e)))?;
                *self = Self::Complete(HandshakeOutcome::from(remote.clone()));
                Ok(())
            }
            _ => Err(P2pError::HandshakeFailed("unexpected auth".to_string())),
        }
    }

    /// Peer's hello, once received.
    pub fn remote_hello(&self) -> Option<&HelloMessage> {
        match self {
            Self::AwaitingAuth { remote, .. } => Some(remote),
            _ => None,
        }
    }

    /// Check if handshake is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Consume the state, yielding the outcome if complete.
    pub fn into_outcome(self) -> P2pResult<HandshakeOutcome> {
        match self {
            Self::Complete(outcome) => Ok(outcome),
            _ => Err(P2pError::HandshakeFailed("handshake incomplete".to_string())),
        }
    }
}

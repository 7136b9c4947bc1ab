//! Ed25519 node keys.

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use super::node_id::NodeId;
use super::signing::Signature;
use crate::error::CryptoError;

/// Ed25519 key pair identifying the local node.
///
/// The public half is the node's [`NodeId`]. The secret half never leaves
/// the process; it only signs handshake transcripts.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair using the OS random number generator.
    pub fn generate() -> Self {
        KeyPair {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create a key pair from a 32-byte secret key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        KeyPair {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Load a key pair from a 64-character hex secret key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_bytes(&secret))
    }

    /// The node identity (public key bytes).
    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with the node key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message))
    }

    /// Hex form of the secret key.
    ///
    /// Use with caution - exposing this compromises the identity.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.as_bytes())
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        KeyPair::from_bytes(self.signing_key.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

//! Signatures over node identities.

use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::node_id::NodeId;
use crate::error::CryptoError;

/// Ed25519 signature, serialized as its raw 64 bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub ed25519_dalek::Signature);

impl Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Signature(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// Raw signature bytes.
    #[inline]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        let bytes: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(raw.len(), &"64 bytes"))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

/// Verify that `signature` over `message` was produced by the key behind `node_id`.
pub fn verify(node_id: &NodeId, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(node_id.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
    key.verify(message, &signature.0)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

//! Error types for the kni core crate.

use std::fmt;

/// Errors related to keys, node identities and signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// The bytes do not encode a valid Ed25519 public key.
    InvalidPublicKey,
    /// The secret key has the wrong length or encoding.
    InvalidSecretKey,
    /// The signature is malformed.
    InvalidSignature,
    /// Signature verification failed (signature doesn't match message/key).
    SignatureVerificationFailed,
    /// A node identity had the wrong number of bytes.
    InvalidNodeIdLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },
    /// A hex string could not be decoded.
    InvalidHex(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidPublicKey => write!(f, "invalid public key"),
            CryptoError::InvalidSecretKey => write!(f, "invalid secret key"),
            CryptoError::InvalidSignature => write!(f, "invalid signature format"),
            CryptoError::SignatureVerificationFailed => write!(f, "signature verification failed"),
            CryptoError::InvalidNodeIdLength { expected, actual } => {
                write!(f, "node id must be {} bytes, got {}", expected, actual)
            }
            CryptoError::InvalidHex(msg) => write!(f, "invalid hex: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::InvalidHex(e.to_string())
    }
}

/// Errors related to serialization and deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializationError {
    /// Failed to encode data to bytes.
    EncodeFailed(String),
    /// Failed to decode data from bytes.
    DecodeFailed(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::EncodeFailed(msg) => write!(f, "encode failed: {}", msg),
            SerializationError::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
        }
    }
}

impl std::error::Error for SerializationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CryptoError::InvalidNodeIdLength { expected: 32, actual: 4 };
        assert_eq!(e.to_string(), "node id must be 32 bytes, got 4");

        let e = SerializationError::DecodeFailed("eof".into());
        assert_eq!(e.to_string(), "decode failed: eof");
    }

    #[test]
    fn test_hex_error_conversion() {
        let err: CryptoError = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, CryptoError::InvalidHex(_)));
    }
}

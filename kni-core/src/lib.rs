//! # kni core
//!
//! Identity and serialization primitives shared by the kni crates:
//! - Ed25519 node keys and the 32-byte [`NodeId`] derived from them
//! - Signing and verification of handshake transcripts
//! - SHA-256 helpers
//! - Deterministic binary serialization

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod error;
pub mod serialization;

pub use crypto::{sha256, sha256_concat, verify, KeyPair, NodeId, Signature, NODE_ID_LEN};
pub use error::{CryptoError, SerializationError};

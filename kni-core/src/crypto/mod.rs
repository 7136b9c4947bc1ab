//! Cryptographic primitives for kni node identities.
//!
//! This module provides:
//! - Ed25519 node key generation and loading from hex
//! - The 32-byte node identity derived from a node key
//! - Signing and verification against a node identity
//! - SHA-256 hashing

mod hashing;
mod keys;
mod node_id;
mod signing;

pub use hashing::{sha256, sha256_concat};
pub use keys::KeyPair;
pub use node_id::{NodeId, NODE_ID_LEN};
pub use signing::{verify, Signature};

//! Wire protocol layer.
//!
//! This module contains:
//! - Frame definitions (handshake, keepalive, protocol messages)
//! - Length-prefixed framing codec
//! - Identity handshake state machine
//! - Protocol registry, version negotiation and handlers

pub mod framing;
pub mod handler;
pub mod handshake;
pub mod messages;
pub mod registry;

// Re-export main types
pub use framing::MessageCodec;
pub use handler::{LoggingHandler, ProtocolHandler};
pub use handshake::{auth_transcript, HandshakeOutcome, HandshakeState, LocalNode};
pub use messages::{AuthMessage, DisconnectReason, Frame, HelloMessage, Message};
pub use registry::{negotiate, Capability, ProtocolDescriptor, ProtocolRegistry};

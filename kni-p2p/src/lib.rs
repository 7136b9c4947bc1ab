//! Peer sessions for kni nodes.
//!
//! This crate connects nodes identified by Ed25519 keys and lets them speak
//! named, versioned protocols over one authenticated TCP session per peer:
//!
//! - `kni://` peer locators
//! - A registry of local protocols and per-session version negotiation
//! - Identity handshake and length-prefixed framing
//! - A peer table, lifecycle events and a server tying them together
//!
//! # Architecture
//!
//! Every peer runs in its own tokio task. Handlers are called inline from
//! that task, so messages of one peer arrive in order and a slow handler
//! only delays its own peer.
//!
//! ```text
//! Server::start()
//! ├── Listener Task (accept, one handshake task per connection)
//! ├── Static Dialer Task (re-dial disconnected static peers)
//! ├── Peer Task 1 (read, dispatch, keepalive)
//! └── Peer Task 2 (read, dispatch, keepalive)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use kni_core::KeyPair;
//! use kni_p2p::{LoggingHandler, P2pConfig, PeerDescriptor, ProtocolRegistry, Server};
//!
//! let mut protocols = ProtocolRegistry::new();
//! protocols.register("istanbul", [(64, 22), (65, 22)], Arc::new(LoggingHandler))?;
//!
//! let config = P2pConfig::new("0.0.0.0:32323".parse()?);
//! let server = Server::new(config, KeyPair::generate(), protocols);
//! let mut events = server.subscribe();
//! server.start().await?;
//!
//! server.dial(&"kni://...@3.38.95.49:32324?discport=0&ntype=cn".parse::<PeerDescriptor>()?).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event);
//! }
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod events;

pub mod manager;
pub mod peer;
pub mod protocol;
pub mod server;

// Re-export main types
pub use address::{NodeRole, PeerDescriptor, RoleTag, LOCATOR_SCHEME};
pub use config::{P2pConfig, MAX_MESSAGE_SIZE, NETWORK_MAGIC};
pub use error::{P2pError, P2pResult};
pub use events::{EventBus, EventSubscription, PeerEvent, PeerEventKind, SubscriptionId};
pub use peer::{ConnectionDirection, PeerHandle, PeerInfo, PeerState};
pub use protocol::{
    Capability, DisconnectReason, LoggingHandler, Message, ProtocolDescriptor, ProtocolHandler,
    ProtocolRegistry,
};
pub use server::{NodeInfo, Server, ServerState};

//! Peer connection management.
//!
//! This module provides:
//! - Authenticated transport sessions
//! - Peer metadata snapshots
//! - Lifecycle state machine
//! - Handles given to protocol handlers

pub mod handle;
pub mod info;
pub mod session;
pub mod state;

// Re-export main types
pub use handle::PeerHandle;
pub use info::{ConnectionDirection, PeerInfo};
pub use session::{Session, SessionTimeouts};
pub use state::PeerState;

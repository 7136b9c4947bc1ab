//! P2P configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::{NodeRole, PeerDescriptor};

/// Network magic bytes opening every frame.
pub const NETWORK_MAGIC: [u8; 4] = *b"KNI1";

/// Maximum frame body size in bytes (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum number of connected peers.
pub const DEFAULT_MAX_PEERS: usize = 25;

/// Default TCP connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Default identity handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default keepalive ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Default idle read timeout. Must stay above the ping interval.
///
/// Time spent inside protocol handlers does not count against it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default limit on a single frame write. A peer that does not drain its
/// socket for this long is dropped.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default number of inbound connections allowed to handshake at once.
pub const DEFAULT_MAX_PENDING_INBOUND: usize = 16;

/// Default interval between re-dials of disconnected static peers.
pub const DEFAULT_STATIC_REDIAL_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-subscriber event queue capacity.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

/// Default user agent string sent in the hello message.
pub const DEFAULT_USER_AGENT: &str = concat!("kni-p2p/", env!("CARGO_PKG_VERSION"));

/// Configuration for a P2P server.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Address to accept inbound connections on. `None` runs dial-only.
    pub listen_addr: Option<SocketAddr>,

    /// Maximum number of connected peers (inbound and outbound together).
    pub max_peers: usize,

    /// Timeout for the outbound TCP connect.
    pub dial_timeout: Duration,

    /// Timeout for completing the identity handshake.
    pub handshake_timeout: Duration,

    /// Interval between keepalive pings on an idle session.
    pub ping_interval: Duration,

    /// A session that receives nothing for this long is dropped.
    pub idle_timeout: Duration,

    /// A frame that cannot be written within this long closes the session.
    pub write_timeout: Duration,

    /// Inbound connections handshaking at the same time. Extra connections
    /// are closed on accept.
    pub max_pending_inbound: usize,

    /// Peers dialed at startup and re-dialed while disconnected.
    pub static_peers: Vec<PeerDescriptor>,

    /// Interval between re-dial rounds for static peers.
    pub static_redial_interval: Duration,

    /// Capacity of each event subscriber's queue.
    pub event_queue_capacity: usize,

    /// User agent string advertised to peers.
    pub user_agent: String,

    /// Role advertised to peers.
    pub role: Option<NodeRole>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_peers: DEFAULT_MAX_PEERS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_pending_inbound: DEFAULT_MAX_PENDING_INBOUND,
            static_peers: Vec::new(),
            static_redial_interval: DEFAULT_STATIC_REDIAL_INTERVAL,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            role: None,
        }
    }
}

impl P2pConfig {
    /// Create a configuration that listens on `listen_addr`.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr: Some(listen_addr),
            ..Default::default()
        }
    }

    /// Create a configuration without a listener.
    pub fn dial_only() -> Self {
        Self::default()
    }

    /// Set the maximum number of peers.
    pub fn with_max_peers(mut self, count: usize) -> Self {
        self.max_peers = count;
        self
    }

    /// Set the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the keepalive interval and idle timeout together.
    pub fn with_keepalive(mut self, ping_interval: Duration, idle_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the frame write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the number of inbound handshakes allowed at once.
    pub fn with_max_pending_inbound(mut self, count: usize) -> Self {
        self.max_pending_inbound = count;
        self
    }

    /// Set the statically configured peers.
    pub fn with_static_peers(mut self, peers: Vec<PeerDescriptor>) -> Self {
        self.static_peers = peers;
        self
    }

    /// Set the static peer re-dial interval.
    pub fn with_static_redial_interval(mut self, interval: Duration) -> Self {
        self.static_redial_interval = interval;
        self
    }

    /// Set the per-subscriber event queue capacity.
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the user agent string.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the advertised role.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = P2pConfig::default();
        assert!(config.listen_addr.is_none());
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
        assert!(config.idle_timeout > config.ping_interval);
        assert!(config.user_agent.starts_with("kni-p2p/"));
    }

    #[test]
    fn test_config_builder() {
        let config = P2pConfig::new("127.0.0.1:32323".parse().unwrap())
            .with_max_peers(4)
            .with_keepalive(Duration::from_secs(1), Duration::from_secs(3))
            .with_event_queue_capacity(8)
            .with_write_timeout(Duration::from_millis(500))
            .with_max_pending_inbound(2)
            .with_role(NodeRole::Endpoint)
            .with_user_agent("test/1.0");

        assert_eq!(config.listen_addr.map(|a| a.port()), Some(32323));
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(3));
        assert_eq!(config.event_queue_capacity, 8);
        assert_eq!(config.write_timeout, Duration::from_millis(500));
        assert_eq!(config.max_pending_inbound, 2);
        assert_eq!(config.role, Some(NodeRole::Endpoint));
        assert_eq!(config.user_agent, "test/1.0");
    }
}

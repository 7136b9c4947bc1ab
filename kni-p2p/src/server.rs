//! The peer-session server.
//!
//! A [`Server`] is an owned value: build it with [`Server::new`], call
//! [`Server::start`] once, and [`Server::stop`] to tear everything down.
//! Several servers can live in one process.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use kni_core::{KeyPair, NodeId};
use tokio::net::TcpListener;

use crate::address::PeerDescriptor;
use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::events::{EventBus, EventSubscription};
use crate::manager::{run_listener, run_static_dialer, PeerManager, PeerRegistry, StaticPeers};
use crate::peer::{PeerHandle, PeerInfo};
use crate::protocol::{LocalNode, ProtocolDescriptor, ProtocolRegistry};

/// Lifecycle of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not started.
    Created,
    /// `start` is binding the listener.
    Starting,
    /// Accepting and dialing.
    Running,
    /// Stopped for good.
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Created => write!(f, "created"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Description of the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Our identity.
    pub id: NodeId,
    /// Our `kni://` locator, when listening.
    pub locator: Option<String>,
    /// Bound listen address, when listening.
    pub listen_addr: Option<SocketAddr>,
    /// Protocols we advertise.
    pub protocols: Vec<ProtocolDescriptor>,
}

enum Lifecycle {
    Created,
    Starting,
    Running {
        manager: Arc<PeerManager>,
        local_addr: Option<SocketAddr>,
    },
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ServerState {
        match self {
            Lifecycle::Created => ServerState::Created,
            Lifecycle::Starting => ServerState::Starting,
            Lifecycle::Running { .. } => ServerState::Running,
            Lifecycle::Stopped => ServerState::Stopped,
        }
    }
}

/// Peer-session server.
pub struct Server {
    config: P2pConfig,
    key: KeyPair,
    protocols: ProtocolRegistry,
    peers: Arc<PeerRegistry>,
    events: EventBus,
    static_peers: StaticPeers,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    /// Create a server. Nothing touches the network until [`start`].
    ///
    /// [`start`]: Server::start
    pub fn new(config: P2pConfig, key: KeyPair, protocols: ProtocolRegistry) -> Self {
        let static_peers: BTreeMap<NodeId, PeerDescriptor> = config
            .static_peers
            .iter()
            .map(|d| (d.id, d.clone()))
            .collect();

        Self {
            events: EventBus::new(config.event_queue_capacity),
            config,
            key,
            protocols,
            peers: Arc::new(PeerRegistry::new()),
            static_peers: Arc::new(Mutex::new(static_peers)),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn manager(&self) -> P2pResult<Arc<PeerManager>> {
        match &*self.lifecycle() {
            Lifecycle::Running { manager, .. } => Ok(manager.clone()),
            _ => Err(P2pError::NotRunning),
        }
    }

    /// Our identity.
    pub fn id(&self) -> NodeId {
        self.key.node_id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.lifecycle().state()
    }

    /// Bind the listener (if configured) and start accepting and dialing.
    ///
    /// Returns once the listener is ready. A server starts at most once.
    pub async fn start(&self) -> P2pResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Created) {
                return Err(P2pError::AlreadyRunning);
            }
            *lifecycle = Lifecycle::Starting;
        }

        let listener = match self.config.listen_addr {
            Some(addr) => match TcpListener::bind(addr).await {
                Ok(listener) => Some(listener),
                Err(source) => {
                    *self.lifecycle() = Lifecycle::Created;
                    return Err(P2pError::BindFailed { addr, source });
                }
            },
            None => None,
        };
        let local_addr = match listener.as_ref().map(TcpListener::local_addr).transpose() {
            Ok(addr) => addr,
            Err(e) => {
                *self.lifecycle() = Lifecycle::Created;
                return Err(P2pError::Io(e));
            }
        };

        let local = LocalNode {
            key: self.key.clone(),
            protocols: self.protocols.descriptors(),
            listen_port: local_addr.map(|a| a.port()).unwrap_or(0),
            role: self.config.role.clone(),
            user_agent: self.config.user_agent.clone(),
        };
        let manager = Arc::new(PeerManager::new(
            self.config.clone(),
            local,
            self.protocols.clone(),
            self.peers.clone(),
            self.events.clone(),
            self.static_peers.clone(),
        ));

        {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Starting) {
                // Stopped while binding.
                return Err(P2pError::NotRunning);
            }
            *lifecycle = Lifecycle::Running {
                manager: manager.clone(),
                local_addr,
            };
        }

        if let Some(listener) = listener {
            manager.spawn(run_listener(manager.clone(), listener));
        }
        manager.spawn(run_static_dialer(manager.clone()));

        match local_addr {
            Some(addr) => tracing::info!(
                node = %self.id().short(),
                addr = %addr,
                protocols = self.protocols.len(),
                "Server started"
            ),
            None => tracing::info!(
                node = %self.id().short(),
                protocols = self.protocols.len(),
                "Server started without listener"
            ),
        }
        Ok(())
    }

    /// Connect to a peer and wait until it is active or the attempt failed.
    pub async fn dial(&self, descriptor: &PeerDescriptor) -> P2pResult<()> {
        let manager = self.manager()?;
        manager.dial(descriptor).await
    }

    /// Disconnect a peer and stop re-dialing it. Returns whether it was
    /// connected.
    ///
    /// The Dropped event follows once its task has finished.
    pub async fn remove_peer(&self, id: &NodeId) -> bool {
        self.static_peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);

        match self.peers.get(id).await {
            Some(handle) => {
                handle.disconnect();
                true
            }
            None => false,
        }
    }

    /// Keep `descriptor` connected while the server runs.
    pub fn add_static_peer(&self, descriptor: PeerDescriptor) {
        match self.manager() {
            Ok(manager) => manager.add_static_peer(descriptor),
            Err(_) => {
                self.static_peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(descriptor.id, descriptor);
            }
        }
    }

    /// Descriptors of the active peers, ordered by identity.
    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        self.peers.descriptors().await
    }

    /// Snapshots of the active peers, ordered by identity.
    pub async fn peers_info(&self) -> Vec<PeerInfo> {
        self.peers.snapshot().await
    }

    /// Handle for one active peer, to send it messages.
    pub async fn peer(&self, id: &NodeId) -> Option<PeerHandle> {
        self.peers.get(id).await
    }

    /// Send one message to an active peer.
    pub async fn send(
        &self,
        id: &NodeId,
        protocol: impl Into<String>,
        code: u64,
        payload: impl Into<Bytes>,
    ) -> P2pResult<()> {
        let handle = self.peers.get(id).await.ok_or(P2pError::PeerNotFound(*id))?;
        handle.send(protocol, code, payload).await
    }

    /// Number of active peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.len().await
    }

    /// Bound listen address, once started with a listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle() {
            Lifecycle::Running { local_addr, .. } => *local_addr,
            _ => None,
        }
    }

    /// Description of the local node.
    pub fn node_info(&self) -> NodeInfo {
        let listen_addr = self.local_addr();
        let locator = listen_addr.map(|addr| {
            let ip = match addr.ip() {
                ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                ip => ip,
            };
            let mut descriptor = PeerDescriptor::new(self.id(), ip.to_string(), addr.port());
            descriptor.role = self.config.role.clone();
            descriptor.to_string()
        });

        NodeInfo {
            id: self.id(),
            locator,
            listen_addr,
            protocols: self.protocols.descriptors(),
        }
    }

    /// Subscribe to peer Added/Dropped events.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Stop the server.
    ///
    /// Cancels every peer, including ones still handshaking, waits for all
    /// tasks, releases the listener and closes the event bus. Stopping a
    /// stopped server does nothing.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);

        if let Lifecycle::Running { manager, .. } = previous {
            tracing::info!(node = %self.id().short(), "Stopping server");
            manager.shutdown().await;
            tracing::info!(node = %self.id().short(), "Server stopped");
        }

        self.events.close();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("protocols", &self.protocols)
            .finish()
    }
}

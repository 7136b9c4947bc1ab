//! Peer manager.
//!
//! Owns everything the server's tasks share: the peer registry, the event
//! bus, the protocol handlers and the shutdown token. Inbound and outbound
//! connections both end in [`PeerManager::activate`], which registers the
//! peer and spawns its task.

pub mod inbound;
pub mod outbound;
pub mod registry;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use kni_core::NodeId;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::address::PeerDescriptor;
use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::events::{EventBus, PeerEvent};
use crate::peer::{PeerHandle, PeerState, Session, SessionTimeouts};
use crate::protocol::{DisconnectReason, LocalNode, Message, ProtocolRegistry};

pub use inbound::run_listener;
pub use outbound::run_static_dialer;
pub use registry::PeerRegistry;

/// Static peers keyed by identity.
pub type StaticPeers = Arc<Mutex<BTreeMap<NodeId, PeerDescriptor>>>;

/// State shared by every task of a running server.
pub struct PeerManager {
    config: P2pConfig,
    local: LocalNode,
    protocols: ProtocolRegistry,
    peers: Arc<PeerRegistry>,
    events: EventBus,
    static_peers: StaticPeers,
    /// Identities with a dial in flight.
    dialing: Mutex<HashSet<NodeId>>,
    /// Slots for inbound connections still handshaking.
    pending_inbound: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl PeerManager {
    /// Create a manager for one server run.
    pub fn new(
        config: P2pConfig,
        local: LocalNode,
        protocols: ProtocolRegistry,
        peers: Arc<PeerRegistry>,
        events: EventBus,
        static_peers: StaticPeers,
    ) -> Self {
        let pending_inbound = Arc::new(Semaphore::new(
            config.max_pending_inbound.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            config,
            local,
            protocols,
            peers,
            events,
            static_peers,
            dialing: Mutex::new(HashSet::new()),
            pending_inbound,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// What we present to peers.
    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    /// The configuration this run was started with.
    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    /// Active peers.
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Session timeouts derived from the configuration.
    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts::from(&self.config)
    }

    /// Check if shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn a task that `shutdown` waits for.
    pub fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Cancel every task and wait until all of them have finished.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn static_peers(&self) -> MutexGuard<'_, BTreeMap<NodeId, PeerDescriptor>> {
        self.static_peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dialing(&self) -> MutexGuard<'_, HashSet<NodeId>> {
        self.dialing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a freshly handshaken session and start its task.
    ///
    /// A session without common protocols is closed with `UselessPeer`
    /// and never becomes active.
    pub async fn activate(self: &Arc<Self>, session: Session) -> P2pResult<()> {
        let id = session.remote_id();

        if session.capabilities().is_empty() {
            tracing::debug!(peer = %id.short(), addr = %session.remote_addr(), "No common protocols, disconnecting");
            session.disconnect(DisconnectReason::UselessPeer).await;
            return Err(P2pError::NoCommonProtocols(id));
        }

        let session = Arc::new(session);
        let cancel = self.shutdown.child_token();
        let handle = PeerHandle::new(session.clone(), cancel);

        if let Err(e) = self.peers.try_add(handle.clone(), self.config.max_peers).await {
            let reason = match &e {
                P2pError::DuplicatePeer(_) => DisconnectReason::AlreadyConnected,
                P2pError::TooManyPeers { .. } => DisconnectReason::TooManyPeers,
                _ => DisconnectReason::NetworkError,
            };
            tracing::debug!(peer = %id.short(), error = %e, "Rejecting peer");
            session.disconnect(reason).await;
            return Err(e);
        }

        handle.transition_to(PeerState::Active);
        tracing::info!(
            peer = %id.short(),
            addr = %session.remote_addr(),
            direction = %session.direction(),
            user_agent = %session.remote().user_agent,
            "Peer connected"
        );
        self.events.publish(PeerEvent::added(handle.info().clone()));

        let manager = self.clone();
        self.tracker.spawn(async move { manager.run_peer(handle).await });
        Ok(())
    }

    /// Peer task: dispatch until something ends the session, then clean up.
    async fn run_peer(self: Arc<Self>, handle: PeerHandle) {
        let session = handle.session().clone();
        let id = handle.id();

        let cause = self.drive_peer(&handle, &session).await;

        handle.transition_to(PeerState::Disconnecting);
        session.disconnect(cause.clone()).await;
        self.peers.remove(&id).await;
        handle.transition_to(PeerState::Closed);

        tracing::info!(peer = %id.short(), reason = %cause, "Peer disconnected");
        self.events.publish(PeerEvent::dropped(handle.info().clone(), cause));
    }

    async fn drive_peer(&self, handle: &PeerHandle, session: &Session) -> DisconnectReason {
        let cancel = handle.cancel_token();

        for capability in &handle.info().capabilities {
            let Some(handler) = self.protocols.handler(&capability.name) else {
                continue;
            };
            tokio::select! {
                _ = cancel.cancelled() => return self.cancel_reason(),
                result = handler.on_connect(handle) => {
                    if let Err(e) = result {
                        tracing::warn!(peer = %handle.id().short(), protocol = %capability.name, error = %e, "Protocol connect hook failed");
                        return DisconnectReason::HandlerError;
                    }
                }
            }
        }

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return self.cancel_reason(),

                _ = ping.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return self.cancel_reason(),
                        result = session.ping() => {
                            if let Err(e) = result {
                                tracing::debug!(peer = %handle.id().short(), error = %e, "Ping failed");
                                return e.disconnect_reason();
                            }
                        }
                    }
                }

                result = session.read_message() => match result {
                    Ok(message) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return self.cancel_reason(),
                            result = self.dispatch(handle, message) => {
                                if let Err(e) = result {
                                    tracing::warn!(peer = %handle.id().short(), error = %e, "Protocol handler failed");
                                    return DisconnectReason::HandlerError;
                                }
                                session.reset_idle_deadline();
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %handle.id().short(), error = %e, "Session ended");
                        return e.disconnect_reason();
                    }
                },
            }
        }
    }

    async fn dispatch(&self, handle: &PeerHandle, message: Message) -> P2pResult<()> {
        tracing::trace!(peer = %handle.id().short(), msg = %message, "Dispatching message");
        match self.protocols.handler(&message.protocol) {
            Some(handler) => handler.handle(handle, message).await,
            None => Ok(()),
        }
    }

    fn cancel_reason(&self) -> DisconnectReason {
        if self.shutdown.is_cancelled() {
            DisconnectReason::Shutdown
        } else {
            DisconnectReason::Requested
        }
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("local", &self.local.id())
            .field("protocols", &self.protocols)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

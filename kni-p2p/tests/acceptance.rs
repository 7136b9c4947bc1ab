//! Acceptance tests for the peer-session layer.
//!
//! These tests run real servers on loopback and verify:
//! 1. Connect - Two nodes handshake, negotiate and exchange messages
//! 2. Negotiation - Highest common version wins; no overlap never activates
//! 3. Uniqueness - Concurrent dials of one identity register once
//! 4. Lifecycle - Events, removal, stop, start/bind errors
//! 5. Static peers - Dropped static peers are re-dialed
//! 6. Admission - Peer and pending-handshake limits on inbound connections
//! 7. Stalls - A peer that stops reading cannot wedge shutdown

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use kni_core::{KeyPair, NodeId};
use kni_p2p::{
    DisconnectReason, LoggingHandler, Message, P2pConfig, P2pError, P2pResult, PeerDescriptor,
    PeerEvent, PeerEventKind, PeerHandle, ProtocolHandler, ProtocolRegistry, Server, ServerState,
};

/// Timeout for a single expected event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards every received message to a channel.
struct Recorder {
    tx: mpsc::UnboundedSender<(NodeId, Message)>,
}

impl ProtocolHandler for Recorder {
    fn handle<'a>(&'a self, peer: &'a PeerHandle, message: Message) -> BoxFuture<'a, P2pResult<()>> {
        let _ = self.tx.send((peer.id(), message));
        futures::future::ready(Ok(())).boxed()
    }
}

/// Fails on every message.
struct Failing;

impl ProtocolHandler for Failing {
    fn handle<'a>(&'a self, _peer: &'a PeerHandle, _message: Message) -> BoxFuture<'a, P2pResult<()>> {
        futures::future::ready(Err(P2pError::Handler("rejected".to_string()))).boxed()
    }
}

/// Never finishes handling a message, so its peer is never read again.
struct Stuck;

impl ProtocolHandler for Stuck {
    fn handle<'a>(&'a self, _peer: &'a PeerHandle, _message: Message) -> BoxFuture<'a, P2pResult<()>> {
        futures::future::pending().boxed()
    }
}

/// Loopback configuration with port 0 (OS assigns port).
fn test_config() -> P2pConfig {
    P2pConfig::new("127.0.0.1:0".parse().unwrap())
        .with_dial_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2))
}

fn foo(versions: &[u32], handler: Arc<dyn ProtocolHandler>) -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    registry
        .register("foo", versions.iter().map(|&v| (v, 8)), handler)
        .unwrap();
    registry
}

fn logging(versions: &[u32]) -> ProtocolRegistry {
    foo(versions, Arc::new(LoggingHandler))
}

async fn start(config: P2pConfig, protocols: ProtocolRegistry) -> Server {
    let server = Server::new(config, KeyPair::generate(), protocols);
    server.start().await.unwrap();
    server
}

fn descriptor_of(server: &Server) -> PeerDescriptor {
    let addr = server.local_addr().unwrap();
    PeerDescriptor::new(server.id(), "127.0.0.1", addr.port())
}

/// Poll `condition` until it holds or `timeout_ms` passes.
async fn wait_for<F, Fut>(timeout_ms: u64, poll_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout_duration = Duration::from_millis(timeout_ms);
    let poll_duration = Duration::from_millis(poll_ms);

    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() > timeout_duration {
            return false;
        }
        sleep(poll_duration).await;
    }
}

async fn next_event(events: &mut kni_p2p::EventSubscription) -> PeerEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

#[tokio::test]
async fn test_two_nodes_connect_and_exchange() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), foo(&[1], Arc::new(Recorder { tx }))).await;

    a.dial(&descriptor_of(&b)).await.unwrap();

    let connected = wait_for(5000, 50, || async { b.peer_count().await == 1 }).await;
    assert!(connected, "B should see A");
    assert_eq!(a.peers().await, vec![descriptor_of(&b)]);

    let peer = a.peer(&b.id()).await.unwrap();
    peer.send("foo", 3, b"hello".to_vec()).await.unwrap();

    let (from, message) = timeout(EVENT_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(from, a.id());
    assert_eq!(message.protocol, "foo");
    assert_eq!(message.code, 3);
    assert_eq!(&message.payload[..], b"hello");

    a.send(&b.id(), "foo", 4, b"again".to_vec()).await.unwrap();
    let (_, message) = timeout(EVENT_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(message.code, 4);

    let stranger = KeyPair::generate().node_id();
    assert!(matches!(
        a.send(&stranger, "foo", 1, Vec::<u8>::new()).await,
        Err(P2pError::PeerNotFound(_))
    ));
    assert!(matches!(
        a.send(&b.id(), "foo", 8, Vec::<u8>::new()).await,
        Err(P2pError::InvalidProtocol { .. })
    ));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_negotiates_highest_common_version() {
    let a = start(test_config(), logging(&[1, 2, 3])).await;
    let b = start(test_config(), logging(&[2, 3, 4])).await;

    a.dial(&descriptor_of(&b)).await.unwrap();
    assert!(wait_for(5000, 50, || async { b.peer_count().await == 1 }).await);

    for server in [&a, &b] {
        let info = server.peers_info().await;
        assert_eq!(info.len(), 1);
        let cap = info[0].capability("foo").unwrap();
        assert_eq!(cap.version, 3);
        assert_eq!(info[0].capabilities.len(), 1);
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_disjoint_versions_never_active() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), logging(&[2])).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let result = a.dial(&descriptor_of(&b)).await;
    assert!(matches!(result, Err(P2pError::NoCommonProtocols(id)) if id == b.id()));

    sleep(Duration::from_millis(300)).await;
    assert!(a.peers().await.is_empty());
    assert!(b.peers().await.is_empty());
    assert!(a_events.try_recv().is_none());
    assert!(b_events.try_recv().is_none());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_concurrent_duplicate_dial() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), logging(&[1])).await;
    let target = descriptor_of(&b);

    let (first, second) = tokio::join!(a.dial(&target), a.dial(&target));
    let results = [first, second];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let duplicate = results
        .iter()
        .filter(|r| matches!(r, Err(P2pError::DuplicatePeer(id)) if *id == b.id()))
        .count();
    assert_eq!((ok, duplicate), (1, 1));
    assert_eq!(a.peer_count().await, 1);

    // Dialing an active peer again is also a duplicate.
    assert!(matches!(
        a.dial(&target).await,
        Err(P2pError::DuplicatePeer(_))
    ));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_events_added_and_dropped() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), logging(&[1])).await;
    let mut events = a.subscribe();

    a.dial(&descriptor_of(&b)).await.unwrap();

    let added = next_event(&mut events).await;
    assert_eq!(added.kind, PeerEventKind::Added);
    assert_eq!(added.peer.id(), b.id());
    assert!(added.cause.is_none());
    assert_eq!(added.peer.capability("foo").map(|c| c.version), Some(1));

    assert!(a.remove_peer(&b.id()).await);
    let dropped = next_event(&mut events).await;
    assert_eq!(dropped.kind, PeerEventKind::Dropped);
    assert_eq!(dropped.peer.id(), b.id());
    assert_eq!(dropped.cause, Some(DisconnectReason::Requested));

    assert!(a.peers().await.is_empty());
    assert!(!a.remove_peer(&b.id()).await);

    // B learns why.
    assert!(wait_for(5000, 50, || async { b.peers().await.is_empty() }).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_remote_sees_disconnect_reason() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), logging(&[1])).await;
    let mut b_events = b.subscribe();

    a.dial(&descriptor_of(&b)).await.unwrap();
    assert_eq!(next_event(&mut b_events).await.kind, PeerEventKind::Added);

    a.stop().await;

    let dropped = next_event(&mut b_events).await;
    assert_eq!(dropped.kind, PeerEventKind::Dropped);
    assert_eq!(
        dropped.cause,
        Some(DisconnectReason::RemoteRequested(Box::new(DisconnectReason::Shutdown)))
    );

    b.stop().await;
}

#[tokio::test]
async fn test_handler_error_drops_peer() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), foo(&[1], Arc::new(Failing))).await;
    let mut b_events = b.subscribe();

    a.dial(&descriptor_of(&b)).await.unwrap();
    assert_eq!(next_event(&mut b_events).await.kind, PeerEventKind::Added);

    let peer = a.peer(&b.id()).await.unwrap();
    peer.send("foo", 0, Vec::<u8>::new()).await.unwrap();

    let dropped = next_event(&mut b_events).await;
    assert_eq!(dropped.cause, Some(DisconnectReason::HandlerError));
    assert!(wait_for(5000, 50, || async { a.peers().await.is_empty() }).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), foo(&[1], Arc::new(Recorder { tx }))).await;

    a.dial(&descriptor_of(&b)).await.unwrap();
    let peer = a.peer(&b.id()).await.unwrap();
    for i in 0..100u32 {
        peer.send("foo", 1, i.to_be_bytes().to_vec()).await.unwrap();
    }

    for i in 0..100u32 {
        let (_, message) = timeout(EVENT_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&message.payload[..], &i.to_be_bytes()[..]);
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_stop_clears_peers_and_closes_events() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), logging(&[1])).await;
    let c = start(test_config(), logging(&[1])).await;
    let mut events = a.subscribe();

    a.dial(&descriptor_of(&b)).await.unwrap();
    c.dial(&descriptor_of(&a)).await.unwrap();
    assert!(wait_for(5000, 50, || async { a.peer_count().await == 2 }).await);

    a.stop().await;
    assert_eq!(a.state(), ServerState::Stopped);
    assert!(a.peers().await.is_empty());
    assert!(a.local_addr().is_none());

    // Two Added, two Dropped with Shutdown, then the bus is closed.
    let mut kinds = Vec::new();
    while let Some(event) = timeout(EVENT_TIMEOUT, events.recv()).await.unwrap() {
        if event.kind == PeerEventKind::Dropped {
            assert_eq!(event.cause, Some(DisconnectReason::Shutdown));
        }
        kinds.push(event.kind);
    }
    assert_eq!(kinds.len(), 4);

    assert!(matches!(
        a.dial(&descriptor_of(&b)).await,
        Err(P2pError::NotRunning)
    ));

    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let a = start(test_config(), logging(&[1])).await;
    assert_eq!(a.state(), ServerState::Running);
    assert!(matches!(a.start().await, Err(P2pError::AlreadyRunning)));

    // A second server on the same address cannot bind.
    let taken = a.local_addr().unwrap();
    let b = Server::new(P2pConfig::new(taken), KeyPair::generate(), logging(&[1]));
    assert!(matches!(b.start().await, Err(P2pError::BindFailed { addr, .. }) if addr == taken));
    assert_eq!(b.state(), ServerState::Created);

    // Dialing ourselves is refused before any connection.
    assert!(matches!(
        a.dial(&descriptor_of(&a)).await,
        Err(P2pError::SelfDial)
    ));

    // Not started yet.
    let c = Server::new(test_config(), KeyPair::generate(), logging(&[1]));
    assert!(matches!(
        c.dial(&descriptor_of(&a)).await,
        Err(P2pError::NotRunning)
    ));

    a.stop().await;
    assert!(matches!(a.start().await, Err(P2pError::AlreadyRunning)));
}

#[tokio::test]
async fn test_dial_wrong_identity_fails() {
    let a = start(test_config(), logging(&[1])).await;
    let b = start(test_config(), logging(&[1])).await;

    let mut target = descriptor_of(&b);
    target.id = KeyPair::generate().node_id();
    assert!(matches!(
        a.dial(&target).await,
        Err(P2pError::HandshakeFailed(_))
    ));
    assert!(a.peers().await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_inbound_limit() {
    let hub = start(test_config().with_max_peers(1), logging(&[1])).await;
    let first = start(test_config(), logging(&[1])).await;
    let second = start(test_config(), logging(&[1])).await;

    first.dial(&descriptor_of(&hub)).await.unwrap();
    assert!(wait_for(5000, 50, || async { hub.peer_count().await == 1 }).await);

    let _ = second.dial(&descriptor_of(&hub)).await;
    assert!(wait_for(5000, 50, || async { second.peers().await.is_empty() }).await);
    let registered = hub.peers_info().await;
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].id(), first.id());

    hub.stop().await;
    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_static_peer_is_redialed() {
    let b = start(test_config(), logging(&[1])).await;
    let config = test_config()
        .with_static_peers(vec![descriptor_of(&b)])
        .with_static_redial_interval(Duration::from_millis(200));
    let a = Server::new(config, KeyPair::generate(), logging(&[1]));
    let mut events = a.subscribe();
    a.start().await.unwrap();

    assert_eq!(next_event(&mut events).await.kind, PeerEventKind::Added);

    // B kicks A; A dials again.
    assert!(wait_for(5000, 50, || async { b.peer_count().await == 1 }).await);
    assert!(b.remove_peer(&a.id()).await);
    assert_eq!(next_event(&mut events).await.kind, PeerEventKind::Dropped);
    assert_eq!(next_event(&mut events).await.kind, PeerEventKind::Added);

    // Removing it locally stops the re-dialing.
    assert!(a.remove_peer(&b.id()).await);
    assert_eq!(next_event(&mut events).await.kind, PeerEventKind::Dropped);
    sleep(Duration::from_millis(600)).await;
    assert!(a.peers().await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_keepalive_holds_idle_session() {
    let config = || test_config().with_keepalive(Duration::from_millis(100), Duration::from_millis(400));
    let a = start(config(), logging(&[1])).await;
    let b = start(config(), logging(&[1])).await;
    let mut events = a.subscribe();

    a.dial(&descriptor_of(&b)).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind, PeerEventKind::Added);

    sleep(Duration::from_millis(1200)).await;
    assert_eq!(a.peer_count().await, 1);
    assert!(events.try_recv().is_none());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_garbage_connection_is_ignored() {
    let a = start(test_config(), logging(&[1])).await;

    let mut stream = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();
    stream.write_all(&[0xffu8; 64]).await.unwrap();
    drop(stream);

    sleep(Duration::from_millis(200)).await;
    assert!(a.peers().await.is_empty());
    assert_eq!(a.state(), ServerState::Running);

    a.stop().await;
}

#[tokio::test]
async fn test_node_info_locator() {
    let a = start(test_config(), logging(&[1, 2])).await;
    let info = a.node_info();

    assert_eq!(info.id, a.id());
    assert_eq!(info.listen_addr, a.local_addr());
    assert_eq!(info.protocols.len(), 2);

    let locator = info.locator.unwrap();
    let parsed: PeerDescriptor = locator.parse().unwrap();
    assert_eq!(parsed, descriptor_of(&a));

    a.stop().await;
}

#[tokio::test]
async fn test_stop_with_stalled_peer() {
    let a = start(
        test_config().with_keepalive(Duration::from_millis(100), Duration::from_secs(600)),
        logging(&[1]),
    )
    .await;
    let b = start(test_config(), foo(&[1], Arc::new(Stuck))).await;

    a.dial(&descriptor_of(&b)).await.unwrap();
    let peer = a.peer(&b.id()).await.unwrap();

    // Fill both socket buffers; the writer ends up parked on the socket.
    let flood = tokio::spawn(async move {
        let payload = vec![0u8; 1 << 20];
        loop {
            if let Err(e) = peer.send("foo", 1, payload.clone()).await {
                return e;
            }
        }
    });
    sleep(Duration::from_secs(2)).await;

    assert!(
        timeout(Duration::from_secs(10), a.stop()).await.is_ok(),
        "stop must not wait on a stalled peer"
    );
    assert!(a.peers().await.is_empty());

    let err = timeout(Duration::from_secs(5), flood).await.unwrap().unwrap();
    assert!(matches!(
        err,
        P2pError::ConnectionClosed | P2pError::WriteTimeout
    ));

    assert!(timeout(Duration::from_secs(10), b.stop()).await.is_ok());
}

#[tokio::test]
async fn test_pending_inbound_limit() {
    let hub = start(test_config().with_max_pending_inbound(1), logging(&[1])).await;
    let other = start(test_config(), logging(&[1])).await;

    // Takes the only handshake slot and never speaks.
    let silent = TcpStream::connect(hub.local_addr().unwrap()).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert!(other.dial(&descriptor_of(&hub)).await.is_err());
    assert!(hub.peers().await.is_empty());

    // Closing it frees the slot.
    drop(silent);
    let connected = wait_for(5000, 100, || async {
        other.dial(&descriptor_of(&hub)).await.is_ok()
    })
    .await;
    assert!(connected);
    assert!(wait_for(5000, 50, || async { hub.peer_count().await == 1 }).await);

    hub.stop().await;
    other.stop().await;
}

//! Transport session.
//!
//! A [`Session`] owns one TCP connection after a completed handshake. Reads
//! and writes go through separate async mutexes so a handler may write while
//! the peer task is parked in a read.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex as SyncMutex;
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use kni_core::NodeId;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::address::{NodeRole, PeerDescriptor};
use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectionDirection, PeerInfo};
use crate::protocol::{
    negotiate, Capability, DisconnectReason, Frame, HandshakeOutcome, HandshakeState, LocalNode,
    Message, MessageCodec,
};

/// Upper bound on flushing a disconnect frame before the socket is dropped.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type Reader = FramedRead<OwnedReadHalf, MessageCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// TCP connect.
    pub dial: Duration,
    /// Whole identity handshake.
    pub handshake: Duration,
    /// Longest silence tolerated on an established session.
    pub idle: Duration,
    /// Longest a single frame write may block.
    pub write: Duration,
}

impl From<&P2pConfig> for SessionTimeouts {
    fn from(config: &P2pConfig) -> Self {
        Self {
            dial: config.dial_timeout,
            handshake: config.handshake_timeout,
            idle: config.idle_timeout,
            write: config.write_timeout,
        }
    }
}

/// An authenticated connection to one peer.
pub struct Session {
    descriptor: PeerDescriptor,
    remote_addr: SocketAddr,
    direction: ConnectionDirection,
    remote: HandshakeOutcome,
    capabilities: Vec<Capability>,
    established_at: SystemTime,
    idle_timeout: Duration,
    write_timeout: Duration,
    /// When the last frame arrived. Idle reads expire relative to this.
    last_received: SyncMutex<Instant>,
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    closed: CancellationToken,
}

impl Session {
    /// Dial `descriptor` and run the handshake.
    ///
    /// The peer must prove the identity named in the descriptor.
    pub async fn open(
        descriptor: &PeerDescriptor,
        local: &LocalNode,
        timeouts: SessionTimeouts,
    ) -> P2pResult<Self> {
        let addr = descriptor.transport_addr();
        tracing::debug!(peer = %descriptor.id.short(), addr = %addr, "Connecting to peer");

        let stream = match timeout(timeouts.dial, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(P2pError::ConnectionRefused {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(P2pError::DialTimeout { addr }),
        };

        tracing::debug!(addr = %addr, "TCP connection established, starting handshake");

        let mut session = Self::establish(
            stream,
            ConnectionDirection::Outbound,
            Some(&descriptor.id),
            local,
            timeouts,
        )
        .await?;

        // Keep the dialed address; fill in the role if the locator had none.
        let mut dialed = descriptor.clone();
        if dialed.role.is_none() {
            dialed.role = session.remote.role.clone();
        }
        session.descriptor = dialed;
        Ok(session)
    }

    /// Run the handshake on an accepted connection.
    pub async fn accept(
        stream: TcpStream,
        local: &LocalNode,
        timeouts: SessionTimeouts,
    ) -> P2pResult<Self> {
        Self::establish(stream, ConnectionDirection::Inbound, None, local, timeouts).await
    }

    async fn establish(
        stream: TcpStream,
        direction: ConnectionDirection,
        expected: Option<&NodeId>,
        local: &LocalNode,
        timeouts: SessionTimeouts,
    ) -> P2pResult<Self> {
        let remote_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, MessageCodec::new());
        let mut writer = FramedWrite::new(write_half, MessageCodec::new());

        let handshake = run_handshake(&mut reader, &mut writer, local, expected);
        let remote = match timeout(timeouts.handshake, handshake).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(P2pError::HandshakeFailed(reason))) => {
                return Err(P2pError::HandshakeFailed(reason));
            }
            Ok(Err(e)) => return Err(P2pError::HandshakeFailed(e.to_string())),
            Err(_) => return Err(P2pError::HandshakeFailed("timed out".to_string())),
        };

        let capabilities = negotiate(&local.protocols, &remote.protocols);
        let descriptor = announced_descriptor(&remote, remote_addr);

        tracing::debug!(
            peer = %remote.node_id.short(),
            addr = %remote_addr,
            direction = %direction,
            capabilities = capabilities.len(),
            "Handshake complete"
        );

        Ok(Self {
            descriptor,
            remote_addr,
            direction,
            remote,
            capabilities,
            established_at: SystemTime::now(),
            idle_timeout: timeouts.idle,
            write_timeout: timeouts.write,
            last_received: SyncMutex::new(Instant::now()),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        })
    }

    /// Proven identity of the peer.
    pub fn remote_id(&self) -> NodeId {
        self.remote.node_id
    }

    /// Where the peer can be reached.
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    /// Socket address of the connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Direction of the connection.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// What the peer announced during the handshake.
    pub fn remote(&self) -> &HandshakeOutcome {
        &self.remote
    }

    /// Role the peer announced, if any.
    pub fn remote_role(&self) -> Option<&NodeRole> {
        self.remote.role.as_ref()
    }

    /// Negotiated protocols, ordered by name.
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Negotiated capability for `name`.
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// Snapshot of this session.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            descriptor: self.descriptor.clone(),
            remote_addr: self.remote_addr,
            direction: self.direction,
            capabilities: self.capabilities.clone(),
            connected_since: self.established_at,
            user_agent: self.remote.user_agent.clone(),
        }
    }

    /// Check if the session was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Read the next protocol message.
    ///
    /// Keepalive frames are handled here and never returned.
    pub async fn read_message(&self) -> P2pResult<Message> {
        let mut reader = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = self.closed.cancelled() => return Err(P2pError::ConnectionClosed),
        };

        loop {
            let deadline = self.last_received() + self.idle_timeout;
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Err(P2pError::ConnectionClosed),
                next = timeout_at(deadline, reader.next()) => match next {
                    Err(_) => return Err(P2pError::Timeout),
                    Ok(None) => {
                        self.close();
                        return Err(P2pError::ConnectionClosed);
                    }
                    Ok(Some(Err(e))) => return Err(e),
                    Ok(Some(Ok(frame))) => frame,
                },
            };
            self.reset_idle_deadline();

            tracing::trace!(peer = %self.remote.node_id.short(), frame = frame.name(), "Received frame");

            match frame {
                Frame::Protocol(message) => {
                    self.check_incoming(&message)?;
                    return Ok(message);
                }
                Frame::Ping(nonce) => self.send_frame(Frame::Pong(nonce)).await?,
                Frame::Pong(_) => {}
                Frame::Disconnect(reason) => {
                    self.close();
                    return Err(P2pError::RemoteDisconnect(reason));
                }
                Frame::Hello(_) | Frame::Auth(_) => {
                    return Err(P2pError::ProtocolViolation(format!(
                        "unexpected {} after handshake",
                        frame.name()
                    )));
                }
            }
        }
    }

    /// Send a protocol message.
    ///
    /// The protocol must be negotiated and the code within its capacity.
    pub async fn write_message(&self, message: Message) -> P2pResult<()> {
        let capability = self.capability(&message.protocol).ok_or_else(|| {
            P2pError::InvalidProtocol {
                name: message.protocol.clone(),
                reason: "not negotiated with this peer".to_string(),
            }
        })?;
        if message.code >= capability.message_capacity {
            return Err(P2pError::InvalidProtocol {
                name: message.protocol.clone(),
                reason: format!(
                    "code {} out of range (capacity {})",
                    message.code, capability.message_capacity
                ),
            });
        }

        self.send_frame(Frame::Protocol(message)).await
    }

    /// Send a keepalive ping.
    pub async fn ping(&self) -> P2pResult<()> {
        self.send_frame(Frame::Ping(rand::random())).await
    }

    /// Tell the peer why we are leaving, then close.
    ///
    /// Best effort: a peer that does not drain its socket is cut off after a
    /// short flush timeout.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let was_open = !self.is_closed();
        tracing::debug!(peer = %self.remote.node_id.short(), reason = %reason, "Disconnecting peer");

        let flush = async move {
            let mut writer = self.writer.lock().await;
            if was_open {
                writer.send(Frame::Disconnect(reason)).await?;
            }
            SinkExt::<Frame>::close(&mut *writer).await
        };

        match timeout(DISCONNECT_FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::trace!(peer = %self.remote.node_id.short(), error = %e, "Disconnect flush failed");
            }
            Err(_) => {
                tracing::trace!(peer = %self.remote.node_id.short(), "Disconnect flush timed out");
            }
        }

        self.close();
    }

    /// Close the session. Idempotent.
    ///
    /// Pending and later reads and writes fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Restart the idle window, as if a frame had just arrived.
    ///
    /// The peer task calls this after a handler returns so that handler
    /// time is not charged to the remote.
    pub(crate) fn reset_idle_deadline(&self) {
        *self.last_received.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn check_incoming(&self, message: &Message) -> P2pResult<()> {
        let capability = self.capability(&message.protocol).ok_or_else(|| {
            P2pError::ProtocolViolation(format!(
                "message for unnegotiated protocol {}",
                message.protocol
            ))
        })?;
        if message.code >= capability.message_capacity {
            return Err(P2pError::ProtocolViolation(format!(
                "{} code {} out of range (capacity {})",
                message.protocol, message.code, capability.message_capacity
            )));
        }
        Ok(())
    }

    async fn send_frame(&self, frame: Frame) -> P2pResult<()> {
        if self.is_closed() {
            return Err(P2pError::ConnectionClosed);
        }

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.closed.cancelled() => return Err(P2pError::ConnectionClosed),
        };

        let result = tokio::select! {
            result = timeout(self.write_timeout, writer.send(frame)) => result,
            _ = self.closed.cancelled() => return Err(P2pError::ConnectionClosed),
        };

        match result {
            Ok(Err(P2pError::Io(e))) => {
                tracing::debug!(peer = %self.remote.node_id.short(), error = %e, "Write failed");
                self.close();
                Err(P2pError::ConnectionClosed)
            }
            Ok(other) => other,
            Err(_) => {
                // A half-written frame leaves the stream unusable.
                tracing::debug!(peer = %self.remote.node_id.short(), "Write timed out");
                self.close();
                Err(P2pError::WriteTimeout)
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.remote.node_id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("capabilities", &self.capabilities)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Hello, then auth, in both directions.
async fn run_handshake(
    reader: &mut Reader,
    writer: &mut Writer,
    local: &LocalNode,
    expected: Option<&NodeId>,
) -> P2pResult<HandshakeOutcome> {
    let mut state = HandshakeState::new();

    let challenge: [u8; 32] = rand::random();
    writer.send(Frame::Hello(local.hello(challenge))).await?;
    state.sent_hello(challenge)?;

    let hello = match next_frame(reader).await? {
        Frame::Hello(hello) => hello,
        other => return Err(unexpected_frame("hello", other)),
    };
    let remote_challenge = hello.challenge;
    state.received_hello(hello, &local.id(), expected)?;

    writer.send(Frame::Auth(local.auth(&remote_challenge))).await?;

    match next_frame(reader).await? {
        Frame::Auth(auth) => state.received_auth(&auth)?,
        other => return Err(unexpected_frame("auth", other)),
    }

    state.into_outcome()
}

async fn next_frame(reader: &mut Reader) -> P2pResult<Frame> {
    match reader.next().await {
        Some(frame) => frame,
        None => Err(P2pError::ConnectionClosed),
    }
}

fn unexpected_frame(wanted: &str, got: Frame) -> P2pError {
    match got {
        Frame::Disconnect(reason) => {
            P2pError::HandshakeFailed(format!("remote disconnected: {}", reason))
        }
        other => P2pError::HandshakeFailed(format!("expected {}, got {}", wanted, other.name())),
    }
}

/// Descriptor built from the connection address and the announced listen port.
fn announced_descriptor(remote: &HandshakeOutcome, remote_addr: SocketAddr) -> PeerDescriptor {
    let host = match remote_addr.ip() {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => ip.to_string(),
        },
    };
    let port = match remote.listen_port {
        0 => remote_addr.port(),
        port => port,
    };

    let descriptor = PeerDescriptor::new(remote.node_id, host, port);
    match &remote.role {
        Some(role) => descriptor.with_role(role.clone()),
        None => descriptor,
    }
}

//! Protocol handlers.

use futures::future::{BoxFuture, FutureExt};

use crate::error::P2pResult;
use crate::peer::PeerHandle;
use crate::protocol::Message;

/// Application side of one protocol.
///
/// Handlers run inside the peer's own task, one message at a time, in
/// arrival order. A slow handler delays only its own peer. Returning an
/// error ends the session with [`DisconnectReason::HandlerError`].
///
/// [`DisconnectReason::HandlerError`]: crate::protocol::DisconnectReason::HandlerError
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Called once when the peer becomes active, before any message is read.
    fn on_connect<'a>(&'a self, _peer: &'a PeerHandle) -> BoxFuture<'a, P2pResult<()>> {
        futures::future::ready(Ok(())).boxed()
    }

    /// Called for every message received for this protocol.
    fn handle<'a>(&'a self, peer: &'a PeerHandle, message: Message) -> BoxFuture<'a, P2pResult<()>>;
}

/// Handler that logs every message and otherwise ignores it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl ProtocolHandler for LoggingHandler {
    fn handle<'a>(&'a self, peer: &'a PeerHandle, message: Message) -> BoxFuture<'a, P2pResult<()>> {
        async move {
            tracing::info!(peer = %peer.id().short(), msg = %message, "Message received");
            Ok(())
        }
        .boxed()
    }
}

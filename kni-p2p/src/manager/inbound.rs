//! Inbound connection listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::error::P2pError;
use crate::manager::PeerManager;
use crate::peer::Session;

/// Accept connections until shutdown.
///
/// Connections beyond `max_peers`, or beyond `max_pending_inbound`
/// handshakes in flight, are closed before the handshake. Each admitted
/// connection handshakes in its own task.
pub async fn run_listener(manager: Arc<PeerManager>, listener: TcpListener) {
    let shutdown = manager.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Inbound listener shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = manager.config().max_peers;
                        if manager.peers().len().await >= max {
                            tracing::debug!(addr = %addr, max = max, "Rejecting inbound connection: too many peers");
                            drop(stream);
                            continue;
                        }

                        let Ok(slot) = manager.pending_inbound.clone().try_acquire_owned() else {
                            tracing::debug!(addr = %addr, "Rejecting inbound connection: too many pending handshakes");
                            drop(stream);
                            continue;
                        };

                        tracing::debug!(addr = %addr, "Accepted inbound connection");
                        let task = manager.clone();
                        manager.spawn(async move {
                            task.accept_inbound(stream, addr).await;
                            drop(slot);
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

impl PeerManager {
    async fn accept_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let session = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = Session::accept(stream, self.local(), self.timeouts()) => result,
        };

        let result = match session {
            Ok(session) => self.activate(session).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(P2pError::NoCommonProtocols(id)) => {
                tracing::debug!(peer = %id.short(), addr = %addr, "Inbound peer shares no protocol");
            }
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Inbound connection failed");
            }
        }
    }
}

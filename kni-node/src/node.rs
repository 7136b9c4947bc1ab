//! Node orchestrator.
//!
//! Runs one peer-session server until a shutdown signal arrives, logging
//! every peer that comes and goes.

use futures::StreamExt;
use kni_p2p::Server;

use crate::config::NodeConfig;
use crate::shutdown::wait_for_shutdown_signal;

/// The main node structure.
pub struct Node {
    config: NodeConfig,
    server: Server,
}

impl Node {
    /// Create a node with the given configuration.
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        let protocols = config.protocol_registry()?;
        let server = Server::new(config.p2p_config(), config.node_key.clone(), protocols);
        Ok(Self { config, server })
    }

    /// The underlying server.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Run the node until SIGINT or SIGTERM.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("Starting kni node...");
        tracing::info!("  Node ID: {}", self.server.id());
        tracing::info!("  Max peers: {}", self.config.max_peers);
        tracing::info!("  Static peers: {}", self.config.static_peers.len());
        for protocol in &self.config.protocols {
            tracing::info!("  Protocol: {} {:?}", protocol.name, protocol.versions);
        }

        // Subscribe before starting so no event is missed.
        let mut events = self.server.subscribe().into_stream().boxed();
        self.server.start().await?;

        let info = self.server.node_info();
        match &info.locator {
            Some(locator) => tracing::info!("Node locator: {}", locator),
            None => tracing::info!("Not listening for inbound connections"),
        }

        let printer = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                tracing::info!(event = %event, "Peer event");
            }
        });

        let signal = wait_for_shutdown_signal().await;

        tracing::info!("Shutting down node...");
        self.server.stop().await;
        let _ = printer.await;
        tracing::info!("Node shutdown complete");

        signal?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_starts_and_stops() {
        let config = NodeConfig::from_toml_str(
            r#"
listen = "127.0.0.1:0"

[[protocols]]
name = "foo"
versions = [1, 2]
lengths = [4, 8]
"#,
        )
        .unwrap();
        let node = Node::new(config).unwrap();

        node.server().start().await.unwrap();
        let info = node.server().node_info();
        assert!(info.locator.unwrap().starts_with("kni://"));
        assert_eq!(info.protocols.len(), 2);

        node.server().stop().await;
        assert_eq!(node.server().peer_count().await, 0);
    }
}

//! Node configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional TOML file, and command-line flags.
//!
//! ```toml
//! listen = "0.0.0.0:32323"
//! nodekeyhex = "<64 hex chars>"
//! max_peers = 25
//! role = "en"
//! static_peers = ["kni://<id>@3.38.95.49:32324?discport=0&ntype=cn"]
//! dial_timeout_secs = 15
//! handshake_timeout_secs = 5
//!
//! [[protocols]]
//! name = "istanbul"
//! versions = [65]
//! lengths = [23]
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kni_core::KeyPair;
use kni_p2p::{LoggingHandler, NodeRole, P2pConfig, PeerDescriptor, ProtocolRegistry};
use serde::Deserialize;

use crate::cli::Cli;

/// Key used when none (or an unusable one) is configured.
pub const DEFAULT_NODE_KEY_HEX: &str =
    "000000000000000000000000000000000000000000000000000000000000dead";

/// Default P2P listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:32323";

/// Protocol spoken when the configuration names none.
pub const DEFAULT_PROTOCOL: &str = "istanbul";

/// Default version of [`DEFAULT_PROTOCOL`].
pub const DEFAULT_PROTOCOL_VERSION: u32 = 65;

/// Message count of [`DEFAULT_PROTOCOL`] at [`DEFAULT_PROTOCOL_VERSION`].
pub const DEFAULT_PROTOCOL_LENGTH: u64 = 23;

/// Configuration file layout. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<SocketAddr>,
    nodekeyhex: Option<String>,
    max_peers: Option<usize>,
    role: Option<String>,
    static_peers: Option<Vec<String>>,
    dial_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    protocols: Option<Vec<ProtocolToml>>,
}

/// One `[[protocols]]` entry.
#[derive(Debug, Clone, Deserialize)]
struct ProtocolToml {
    name: String,
    versions: Vec<u32>,
    lengths: Vec<u64>,
}

/// A protocol the node registers, with its message count per version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSpec {
    /// Protocol name.
    pub name: String,
    /// `(version, message count)` pairs.
    pub versions: Vec<(u32, u64)>,
}

impl ProtocolSpec {
    fn from_toml(raw: ProtocolToml) -> anyhow::Result<Self> {
        if raw.versions.len() != raw.lengths.len() {
            anyhow::bail!(
                "protocol {}: {} versions but {} lengths",
                raw.name,
                raw.versions.len(),
                raw.lengths.len()
            );
        }
        Ok(Self {
            versions: raw.versions.into_iter().zip(raw.lengths).collect(),
            name: raw.name,
        })
    }
}

impl Default for ProtocolSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROTOCOL.to_string(),
            versions: vec![(DEFAULT_PROTOCOL_VERSION, DEFAULT_PROTOCOL_LENGTH)],
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// P2P listen address. `None` runs dial-only.
    pub listen: Option<SocketAddr>,

    /// Node identity key.
    pub node_key: KeyPair,

    /// Maximum number of connected peers.
    pub max_peers: usize,

    /// Role advertised to peers.
    pub role: Option<NodeRole>,

    /// Peers kept connected.
    pub static_peers: Vec<PeerDescriptor>,

    /// Outbound TCP connect timeout.
    pub dial_timeout: Duration,

    /// Identity handshake timeout.
    pub handshake_timeout: Duration,

    /// Protocols to register.
    pub protocols: Vec<ProtocolSpec>,
}

impl NodeConfig {
    /// Build the configuration from CLI arguments and the file they name.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    /// Parse a TOML document with no CLI overrides on top.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let file: FileConfig = toml::from_str(content).context("TOML parse error")?;
        Self::merge(&Cli::parse_from(["kni-node"]), file)
    }

    fn merge(cli: &Cli, file: FileConfig) -> anyhow::Result<Self> {
        let defaults = P2pConfig::default();

        let listen = if cli.no_listen {
            None
        } else {
            match cli.listen.or(file.listen) {
                Some(addr) => Some(addr),
                None => Some(DEFAULT_LISTEN_ADDR.parse()?),
            }
        };

        let key_hex = cli.nodekeyhex.clone().or(file.nodekeyhex);
        let node_key = node_key_or_default(key_hex.as_deref())?;

        let role = match cli.ntype.clone().or(file.role) {
            Some(tag) => Some(tag.parse::<NodeRole>().context("invalid role")?),
            None => None,
        };

        let locators = cli.static_peers.clone().or(file.static_peers).unwrap_or_default();
        let static_peers = parse_static_peers(&locators);

        let protocols = match file.protocols {
            Some(raw) if !raw.is_empty() => raw
                .into_iter()
                .map(ProtocolSpec::from_toml)
                .collect::<anyhow::Result<Vec<_>>>()?,
            _ => vec![ProtocolSpec::default()],
        };

        Ok(Self {
            listen,
            node_key,
            max_peers: cli.max_peers.or(file.max_peers).unwrap_or(defaults.max_peers),
            role,
            static_peers,
            dial_timeout: file
                .dial_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.dial_timeout),
            handshake_timeout: file
                .handshake_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake_timeout),
            protocols,
        })
    }

    /// Build P2P configuration from node config.
    pub fn p2p_config(&self) -> P2pConfig {
        let mut config = match self.listen {
            Some(addr) => P2pConfig::new(addr),
            None => P2pConfig::dial_only(),
        }
        .with_max_peers(self.max_peers)
        .with_dial_timeout(self.dial_timeout)
        .with_handshake_timeout(self.handshake_timeout)
        .with_static_peers(self.static_peers.clone());

        if let Some(role) = &self.role {
            config = config.with_role(role.clone());
        }
        config
    }

    /// Register every configured protocol with a logging handler.
    pub fn protocol_registry(&self) -> anyhow::Result<ProtocolRegistry> {
        let handler = Arc::new(LoggingHandler);
        let mut registry = ProtocolRegistry::new();
        for protocol in &self.protocols {
            registry
                .register(protocol.name.clone(), protocol.versions.iter().copied(), handler.clone())
                .with_context(|| format!("cannot register protocol {}", protocol.name))?;
        }
        Ok(registry)
    }
}

fn read_file(path: &Path) -> anyhow::Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let file = toml::from_str(&content)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded configuration file");
    Ok(file)
}

/// The configured key, or the fixed development key if it is missing or
/// unusable.
fn node_key_or_default(hex: Option<&str>) -> anyhow::Result<KeyPair> {
    if let Some(hex) = hex {
        match KeyPair::from_hex(hex) {
            Ok(key) => return Ok(key),
            Err(e) => tracing::warn!(error = %e, "Invalid nodekeyhex"),
        }
    }
    tracing::warn!("Setting nodekeyhex to default");
    KeyPair::from_hex(DEFAULT_NODE_KEY_HEX).context("default node key")
}

/// Parse locators, skipping (and logging) the ones that do not parse.
fn parse_static_peers(locators: &[String]) -> Vec<PeerDescriptor> {
    let mut peers = Vec::new();
    for locator in locators {
        let trimmed = locator.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<PeerDescriptor>() {
            Ok(peer) => peers.push(peer),
            Err(e) => {
                tracing::warn!(locator = %trimmed, error = %e, "Skipping invalid static peer");
            }
        }
    }
    peers
}

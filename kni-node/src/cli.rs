//! Command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Standalone kni peer node.
#[derive(Parser, Debug, Clone)]
#[command(name = "kni-node")]
#[command(about = "Connects to kni peers and logs their protocol traffic")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file. Command-line flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// P2P listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Do not accept inbound connections.
    #[arg(long, conflicts_with = "listen")]
    pub no_listen: bool,

    /// Node private key as 64 hex characters.
    #[arg(long)]
    pub nodekeyhex: Option<String>,

    /// Maximum number of connected peers.
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// Comma-separated list of kni:// locators to keep connected.
    #[arg(long, value_delimiter = ',')]
    pub static_peers: Option<Vec<String>>,

    /// Role tag advertised to peers (cn, pn, en, bn).
    #[arg(long)]
    pub ntype: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

//! CLI argument parsing and config file support.
//!
//! The daemon can be configured via CLI flags, a JSON config file,
//! or a combination of both (CLI overrides config file).

use std::path::{Path, PathBuf};

use clap::Parser;
use libp2p::Multiaddr;

use partyline_node::NodeConfig;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Party Line daemon: headless P2P chat peer.
#[derive(Debug, Parser)]
#[command(name = "partyline-daemon", version, about)]
pub struct CliArgs {
    /// Nickname announced to peers (default: $USER).
    #[arg(long = "nick", value_name = "NAME")]
    pub nickname: Option<String>,

    /// Never dial private, loopback or link-local addresses.
    #[arg(long)]
    pub no_lan: bool,

    /// Add a DHT bootstrap node (repeatable).
    #[arg(long = "bootstrap", value_name = "MULTIADDR")]
    pub bootstrap_nodes: Vec<String>,

    /// Add a circuit relay server (repeatable).
    #[arg(long = "relay", value_name = "MULTIADDR")]
    pub relay_servers: Vec<String>,

    /// Load settings from a JSON config file.
    #[arg(long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Peer ids or /p2p multiaddrs to connect to at startup.
    #[arg(value_name = "PEER")]
    pub peers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Fully resolved daemon configuration.
///
/// The JSON file holds a [`NodeConfig`]; every field is optional.
///
/// Example `daemon.json`:
/// ```json
/// {
///   "nickname": "alice",
///   "network": {
///     "block_local_dials": true,
///     "relay_servers": [
///       "/ip4/203.0.113.1/tcp/4001/p2p/12D3KooW..."
///     ]
///   },
///   "peers": ["12D3KooW..."]
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub node: NodeConfig,
}

impl DaemonConfig {
    /// Build config purely from CLI args with defaults.
    pub fn from_cli(cli: &CliArgs) -> Self {
        let node = NodeConfig {
            nickname: default_nickname(),
            ..NodeConfig::default()
        };
        Self { node }.merge_cli(cli)
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;
        Self::from_json(&text)
    }

    /// Parses the JSON config file format.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let node: NodeConfig =
            serde_json::from_str(text).map_err(|e| format!("invalid config JSON: {e}"))?;
        Ok(Self { node })
    }

    /// Merge CLI overrides onto a config-file base.
    ///
    /// Scalar flags replace file values; list flags extend them.
    pub fn merge_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(ref nick) = cli.nickname {
            self.node.nickname = nick.clone();
        }
        if cli.no_lan {
            self.node.network.block_local_dials = true;
        }
        self.node
            .network
            .bootstrap_nodes
            .extend(parse_addrs(&cli.bootstrap_nodes, "bootstrap"));
        self.node
            .network
            .relay_servers
            .extend(parse_addrs(&cli.relay_servers, "relay"));
        self.node.peers.extend(cli.peers.iter().cloned());
        self
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Nickname from `$USER`, falling back to the node default.
fn default_nickname() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.trim().is_empty())
        .unwrap_or_else(|| NodeConfig::default().nickname)
}

/// Parses multiaddr strings, skipping (and warning about) invalid ones.
fn parse_addrs(raw: &[String], label: &str) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!(addr = %s, %e, "ignoring invalid {label} address");
                None
            }
        })
        .collect()
}

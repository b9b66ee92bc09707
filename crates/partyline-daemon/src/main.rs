//! Party Line Daemon -- headless peer for servers and terminals.
//!
//! Usage:
//!
//!   partyline-daemon [OPTIONS] [PEER]...
//!
//! Options:
//!
//!   --nick <NAME>           Nickname announced to peers (default: $USER)
//!   --no-lan                Never dial private or loopback addresses
//!   --bootstrap <MULTIADDR> Add a DHT bootstrap node (repeatable)
//!   --relay <MULTIADDR>     Add a circuit relay server (repeatable)
//!   --config <PATH>         Load config from JSON file
//!   -h, --help              Show usage
//!
//! The daemon runs until interrupted with Ctrl+C.

use clap::Parser;
use partyline_node::{Node, NodeConfig};

mod config;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    print_banner();

    // Parse CLI arguments.
    let cli = config::CliArgs::parse();

    // Load or merge config file if provided.
    let daemon_config = match &cli.config_path {
        Some(path) => match config::DaemonConfig::load(path) {
            Ok(cfg) => cfg.merge_cli(&cli),
            Err(e) => {
                tracing::error!("failed to load config file: {e}");
                std::process::exit(1);
            }
        },
        None => config::DaemonConfig::from_cli(&cli),
    };

    if let Err(e) = run_daemon(daemon_config.node).await {
        tracing::error!("daemon failed: {e}");
        eprintln!();
        eprintln!("[ERROR] {e}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Daemon lifecycle
// ---------------------------------------------------------------------------

async fn run_daemon(cfg: NodeConfig) -> Result<(), String> {
    let peers = cfg.peers.len();
    let lan = if cfg.network.block_local_dials { "blocked" } else { "allowed" };

    let mut node = Node::new(cfg).map_err(|e| format!("node creation failed: {e}"))?;

    // Bootstrap, relay reservation and NAT diagnostics all happen here.
    node.start()
        .await
        .map_err(|e| format!("node start failed: {e}"))?;

    let user = node.local_user().clone();
    let addresses = node
        .network()
        .map(|network| network.addresses().to_vec())
        .unwrap_or_default();

    println!();
    println!("============================================================");
    println!("  Party Line running");
    println!("============================================================");
    println!("  Nickname:     {}", user.nickname);
    println!("  Peer ID:      {}", user.peer_id);
    for addr in &addresses {
        println!("  Address:      {addr}");
    }
    println!("  LAN dials:    {lan}");
    println!("  Peers queued: {peers}");
    println!("============================================================");
    println!("  Press Ctrl+C to stop");
    println!("============================================================");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(%e, "could not listen for Ctrl+C");
    }
    tracing::info!("received Ctrl+C, shutting down...");

    node.shutdown()
        .map_err(|e| format!("shutdown failed: {e}"))?;

    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn print_banner() {
    println!(r#"
  ____            _           _     _
 |  _ \ __ _ _ __| |_ _   _  | |   (_)_ __   ___
 | |_) / _` | '__| __| | | | | |   | | '_ \ / _ \
 |  __/ (_| | |  | |_| |_| | | |___| | | | |  __/
 |_|   \__,_|_|   \__|\__, | |_____|_|_| |_|\___|
                      |___/           daemon v{}
"#, env!("CARGO_PKG_VERSION"));
}

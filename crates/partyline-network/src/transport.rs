//! Transport configuration for the Party Line network layer.
//!
//! # Transport Architecture
//!
//! - **TCP + Noise + Yamux**: the transport the static relay speaks.
//! - **QUIC**: built-in TLS 1.3 and multiplexing.
//! - **DNS**: resolves `/dnsaddr` bootstrap entries.
//! - **Relay client**: `/p2p-circuit` reservations and relayed dials.
//!
//! The actual transport setup lives in [`crate::host::build_swarm`]:
//!
//! ```text
//! SwarmBuilder::with_existing_identity(keypair)
//!     .with_tokio()
//!     .with_tcp(tcp_config(), noise::Config::new, yamux::Config::default)?
//!     .with_quic()
//!     .with_dns()?
//!     .with_relay_client(noise::Config::new, yamux::Config::default)?
//!     .with_behaviour(|key, relay_client| { ... })?
//!     .build()
//! ```

use std::time::Duration;

/// Interval at which established connections are kept alive by the
/// yamux/QUIC layers while a chat stream is open.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Returns the TCP configuration used by the swarm builder.
///
/// Nagle's algorithm is disabled (`nodelay`): chat records are small and
/// latency-sensitive.
pub fn tcp_config() -> libp2p::tcp::Config {
    libp2p::tcp::Config::default().nodelay(true)
}

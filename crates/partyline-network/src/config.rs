//! Network configuration for the Party Line libp2p layer.
//!
//! All values have documented defaults. Validation ensures no
//! zero-valued timeouts, capacities or malformed protocol names at
//! startup.
//!
//! This config lives in `partyline-network` rather than
//! `partyline-types` to keep `libp2p::Multiaddr` out of the shared
//! types crate.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use partyline_types::{PartyLineError, Result};

use crate::nat::transport_of;

// ---------------------------------------------------------------------------
// Well-known peers
// ---------------------------------------------------------------------------

/// Public IPFS DHT bootstrap peers.
///
/// The node joins the DHT in client mode through these to learn its
/// observed addresses and to look peers up by id.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Static circuit relay used for reservations and hole-punch
/// coordination.
///
/// Format: `/ip4/<ip>/tcp/<port>/p2p/<peer_id>`
pub const DEFAULT_RELAY_NODES: &[&str] =
    &["/ip4/54.255.209.104/tcp/12001/p2p/Qma71QQyJN7Sw7gz1cgJ4C66ubHmvKqBasSegKRugM5qo6"];

/// Network-layer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    // -----------------------------------------------------------------------
    // Core networking
    // -----------------------------------------------------------------------

    /// Multiaddrs this node listens on.
    ///
    /// Default: `/ip4/0.0.0.0/tcp/0` and `/ip4/0.0.0.0/udp/0/quic-v1`
    /// (OS-assigned ports on all interfaces).
    #[serde(with = "multiaddr_vec_serde")]
    pub listen_addrs: Vec<Multiaddr>,

    /// Extra bootstrap nodes, merged with [`DEFAULT_BOOTSTRAP_NODES`].
    ///
    /// Each entry must contain a `/p2p/<peer_id>` component.
    #[serde(with = "multiaddr_vec_serde")]
    pub bootstrap_nodes: Vec<Multiaddr>,

    /// Extra relay servers, merged with [`DEFAULT_RELAY_NODES`].
    ///
    /// Each entry must contain a `/p2p/<peer_id>` component.
    #[serde(with = "multiaddr_vec_serde")]
    pub relay_servers: Vec<Multiaddr>,

    /// Whether the built-in bootstrap and relay lists are merged in.
    ///
    /// Default: `true`.
    pub use_default_nodes: bool,

    /// Reject outbound dials to loopback, private and link-local
    /// addresses before any handshake.
    ///
    /// Default: `false`.
    pub block_local_dials: bool,

    /// Seconds before an idle connection is closed by the swarm.
    pub idle_timeout_secs: u64,

    /// Seconds before `connect_to_peer` gives up on a dial.
    ///
    /// Default: `20`.
    pub dial_timeout_secs: u64,

    /// Seconds allowed for the `Hello` exchange on a new stream.
    ///
    /// Default: `10`.
    pub handshake_timeout_secs: u64,

    /// Capacity of each peer's outbound message queue.
    ///
    /// Default: `1024`.
    pub outbound_queue_capacity: usize,

    // -----------------------------------------------------------------------
    // Kademlia DHT
    // -----------------------------------------------------------------------

    /// Kademlia protocol name. The default joins the public IPFS DHT.
    ///
    /// Default: `/ipfs/kad/1.0.0`.
    pub kad_protocol: String,

    /// Seconds before a Kademlia query times out.
    pub kad_query_timeout_secs: u64,

    // -----------------------------------------------------------------------
    // NAT traversal
    // -----------------------------------------------------------------------

    /// Number of AutoNAT confirmations before a status is stable.
    ///
    /// Default: `3`.
    pub autonat_confidence_max: usize,

    /// Seconds between checks for a relayed listen address.
    ///
    /// Default: `5`.
    pub relay_poll_interval_secs: u64,

    /// How many checks for a relayed listen address before startup
    /// fails.
    ///
    /// Default: `24` (two minutes at the default interval).
    pub relay_poll_max_attempts: u32,

    /// Seconds to wait for NAT classifications before startup fails.
    ///
    /// Default: `60`.
    pub nat_diagnostic_timeout_secs: u64,

    /// Number of distinct transports (`tcp`, `udp`) that must be
    /// classified before startup continues. A private verdict covers
    /// every transport. Zero skips the diagnostic. Must not exceed the
    /// number of distinct transports in `listen_addrs`.
    ///
    /// Default: `1`.
    pub nat_transports: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        // Built without parsing to avoid expect()/unwrap().
        let tcp = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(0));
        let quic = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Udp(0))
            .with(Protocol::QuicV1);

        Self {
            listen_addrs: vec![tcp, quic],
            bootstrap_nodes: Vec::new(),
            relay_servers: Vec::new(),
            use_default_nodes: true,
            block_local_dials: false,
            idle_timeout_secs: 60,
            dial_timeout_secs: 20,
            handshake_timeout_secs: 10,
            outbound_queue_capacity: 1024,
            kad_protocol: "/ipfs/kad/1.0.0".into(),
            kad_query_timeout_secs: 30,
            autonat_confidence_max: 3,
            relay_poll_interval_secs: 5,
            relay_poll_max_attempts: 24,
            nat_diagnostic_timeout_secs: 60,
            nat_transports: 1,
        }
    }
}

impl NetworkConfig {
    /// Returns the effective bootstrap nodes: built-in defaults (unless
    /// disabled) followed by user-configured nodes, deduplicated.
    pub fn effective_bootstrap_nodes(&self) -> Vec<Multiaddr> {
        merge_with_defaults(DEFAULT_BOOTSTRAP_NODES, &self.bootstrap_nodes, self.use_default_nodes)
    }

    /// Returns the effective relay servers, built the same way as
    /// [`Self::effective_bootstrap_nodes`].
    pub fn effective_relay_servers(&self) -> Vec<Multiaddr> {
        merge_with_defaults(DEFAULT_RELAY_NODES, &self.relay_servers, self.use_default_nodes)
    }

    /// Dial timeout as a `Duration`.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        let nonzero_secs = [
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("kad_query_timeout_secs", self.kad_query_timeout_secs),
            ("relay_poll_interval_secs", self.relay_poll_interval_secs),
            ("nat_diagnostic_timeout_secs", self.nat_diagnostic_timeout_secs),
        ];
        for (name, value) in nonzero_secs {
            if value == 0 {
                return Err(config_error(format!("{name} must be greater than 0")));
            }
        }

        if self.listen_addrs.is_empty() {
            return Err(config_error("listen_addrs must not be empty"));
        }
        let transports: BTreeSet<&str> =
            self.listen_addrs.iter().filter_map(transport_of).collect();
        if self.nat_transports > transports.len() {
            return Err(config_error(format!(
                "nat_transports is {} but listen_addrs only use {} transport(s)",
                self.nat_transports,
                transports.len()
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(config_error("outbound_queue_capacity must be greater than 0"));
        }
        if self.relay_poll_max_attempts == 0 {
            return Err(config_error("relay_poll_max_attempts must be greater than 0"));
        }
        if self.autonat_confidence_max == 0 {
            return Err(config_error("autonat_confidence_max must be greater than 0"));
        }
        if self.kad_protocol.is_empty() {
            return Err(config_error("kad_protocol must not be empty"));
        }
        if !self.kad_protocol.starts_with('/') {
            return Err(config_error("kad_protocol must start with '/'"));
        }

        for addr in self.bootstrap_nodes.iter().chain(&self.relay_servers) {
            if !addr.iter().any(|p| matches!(p, Protocol::P2p(_))) {
                return Err(config_error(format!(
                    "{addr} is missing a /p2p/<peer_id> component"
                )));
            }
        }

        Ok(())
    }
}

fn merge_with_defaults(defaults: &[&str], extra: &[Multiaddr], use_defaults: bool) -> Vec<Multiaddr> {
    let mut nodes: Vec<Multiaddr> = if use_defaults {
        defaults.iter().filter_map(|s| s.parse().ok()).collect()
    } else {
        Vec::new()
    };
    for addr in extra {
        if !nodes.contains(addr) {
            nodes.push(addr.clone());
        }
    }
    nodes
}

fn config_error(reason: impl Into<String>) -> PartyLineError {
    PartyLineError::ConfigError {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Serde helper: Multiaddr lists as strings
// ---------------------------------------------------------------------------

mod multiaddr_vec_serde {
    use libp2p::Multiaddr;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addrs: &[Multiaddr], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(addrs.len()))?;
        for addr in addrs {
            seq.serialize_element(&addr.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<Multiaddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! DHT-based peer discovery for the Party Line network.
//!
//! Wraps Kademlia and Identify into a single [`NetworkBehaviour`] that
//! provides:
//!
//! - **Bootstrap**: seed the Kademlia routing table with the public
//!   bootstrap peers and run a self-lookup.
//! - **Peer lookup**: a closest-peers query for a bare `PeerId`, which
//!   leaves the peer's addresses in the routing table when it is found.
//! - **Identify**: exchange listen addresses and observed addresses on
//!   every new connection. Kademlia and AutoNAT both feed on it.

use std::time::Duration;

use libp2p::identity;
use libp2p::kad;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, Multiaddr, PeerId, StreamProtocol};

use partyline_types::PartyLineError;

use crate::config::NetworkConfig;

/// Local alias so we never shadow `std::result::Result` (which the
/// `#[derive(NetworkBehaviour)]` macro needs).
type BResult<T> = std::result::Result<T, PartyLineError>;

/// Identify protocol version announced to peers.
pub const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

// ---------------------------------------------------------------------------
// Combined NetworkBehaviour
// ---------------------------------------------------------------------------

/// Combined network behaviour providing Kademlia DHT and Identify.
#[derive(NetworkBehaviour)]
pub struct DiscoveryBehaviour {
    /// Kademlia DHT, run in client mode.
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,

    /// Identify protocol.
    pub identify: identify::Behaviour,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Builds a [`DiscoveryBehaviour`] from the given identity and config.
///
/// # Errors
///
/// Returns `ConfigError` if the Kademlia protocol name is invalid.
pub fn build_discovery_behaviour(
    keypair: &identity::Keypair,
    config: &NetworkConfig,
) -> BResult<DiscoveryBehaviour> {
    let local_peer_id = PeerId::from(keypair.public());

    let protocol = StreamProtocol::try_from_owned(config.kad_protocol.clone()).map_err(|e| {
        PartyLineError::ConfigError {
            reason: format!("invalid Kademlia protocol name '{}': {e}", config.kad_protocol),
        }
    })?;

    let mut kad_config = kad::Config::new(protocol);
    kad_config.set_query_timeout(Duration::from_secs(config.kad_query_timeout_secs));

    let store = kad::store::MemoryStore::new(local_peer_id);
    let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
    kademlia.set_mode(Some(kad::Mode::Client));

    let identify_config = identify::Config::new(IDENTIFY_PROTOCOL.into(), keypair.public())
        .with_agent_version(format!("party-line/{}", env!("CARGO_PKG_VERSION")));
    let identify = identify::Behaviour::new(identify_config);

    Ok(DiscoveryBehaviour { kademlia, identify })
}

// ---------------------------------------------------------------------------
// DHT operations
// ---------------------------------------------------------------------------

impl DiscoveryBehaviour {
    /// Adds bootstrap nodes to the Kademlia routing table.
    ///
    /// Each multiaddr must contain a `/p2p/<peer_id>` component.
    /// Addresses without a peer ID are skipped with a warning.
    ///
    /// Returns how many nodes were added.
    ///
    /// # Errors
    ///
    /// Returns `StartupFatal` if nodes were given but none was usable.
    pub fn add_bootstrap_nodes(&mut self, nodes: &[Multiaddr]) -> BResult<usize> {
        let mut added = 0usize;

        for addr in nodes {
            match extract_peer_id(addr) {
                Some((peer_id, clean_addr)) => {
                    self.kademlia.add_address(&peer_id, clean_addr);
                    added += 1;
                    tracing::debug!(%peer_id, %addr, "added bootstrap node to Kademlia routing table");
                }
                None => {
                    tracing::warn!(%addr, "skipping bootstrap node: missing /p2p/ component");
                }
            }
        }

        if !nodes.is_empty() && added == 0 {
            return Err(PartyLineError::StartupFatal {
                reason: "no valid bootstrap nodes found (all missing /p2p/ component)".into(),
            });
        }

        Ok(added)
    }

    /// Initiates a Kademlia bootstrap operation.
    ///
    /// # Errors
    ///
    /// Returns `StartupFatal` if the routing table is empty.
    pub fn bootstrap(&mut self) -> BResult<kad::QueryId> {
        self.kademlia
            .bootstrap()
            .map_err(|e| PartyLineError::StartupFatal {
                reason: format!("failed to start Kademlia bootstrap: {e}"),
            })
    }

    /// Starts a closest-peers lookup for `peer_id`.
    ///
    /// The result arrives as a Kademlia event; addresses learned on the
    /// way are kept by the swarm and used by later dials.
    pub fn lookup_peer(&mut self, peer_id: PeerId) -> kad::QueryId {
        self.kademlia.get_closest_peers(peer_id)
    }

    /// Records a known address for `peer_id` in the routing table.
    pub fn add_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        self.kademlia.add_address(peer_id, addr);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extracts the `PeerId` and the address-without-p2p from a multiaddr.
///
/// Given `/ip4/1.2.3.4/tcp/4001/p2p/12D3KooW...`, returns
/// `Some((PeerId, /ip4/1.2.3.4/tcp/4001))`. For relayed addresses the
/// last `/p2p/` component (the target) wins and the relay's own id stays
/// in the returned address.
///
/// Returns `None` if the multiaddr does not end in a `/p2p/` component.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut clean_addr = addr.clone();
    match clean_addr.pop() {
        Some(Protocol::P2p(peer_id)) => Some((peer_id, clean_addr)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

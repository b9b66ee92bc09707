//! Outbound connection gate for LAN-free setups.
//!
//! With `block_local_dials` enabled, local addresses (loopback, private
//! range, link-local) are filtered out at two points:
//!
//! - chat dials go through the host with [`dialable_addrs`] applied and
//!   without addresses other behaviours know, and identify never adds
//!   local listen addresses to the DHT routing table;
//! - [`LocalDialGate`] denies any remaining outbound connection to a
//!   local address before it is handed to a protocol, so no stream or
//!   `Hello` runs over a local path.
//!
//! Demo setups use this to prove relayed or hole-punched connectivity
//! instead of silently falling back to the LAN.
//!
//! Inbound connections are never gated.

use std::convert::Infallible;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::task::{Context, Poll};

use libp2p::core::transport::PortUse;
use libp2p::core::Endpoint;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler,
    THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Address classification
// ---------------------------------------------------------------------------

/// Returns whether `addr` resolves to this host or the local network.
///
/// Only the first network-layer component is inspected: a relayed
/// address is local exactly when the path to its relay is.
pub fn is_local_multiaddr(addr: &Multiaddr) -> bool {
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => return is_local_ipv4(ip),
            Protocol::Ip6(ip) => return is_local_ipv6(ip),
            Protocol::Dns(host) | Protocol::Dns4(host) | Protocol::Dns6(host) => {
                return host.eq_ignore_ascii_case("localhost");
            }
            _ => {}
        }
    }
    false
}

fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_local_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_local_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Keeps only the addresses the gate would let through.
pub fn dialable_addrs(addrs: &[Multiaddr], block_local: bool) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter(|a| !block_local || !is_local_multiaddr(a))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Denial reason
// ---------------------------------------------------------------------------

/// Reason attached to a [`ConnectionDenied`] raised by the gate.
#[derive(Debug, Error)]
#[error("outbound dial to local address {addr} blocked")]
pub struct LocalDialBlocked {
    /// The rejected address (the first one, for multi-address dials).
    pub addr: Multiaddr,
}

// ---------------------------------------------------------------------------
// LocalDialGate
// ---------------------------------------------------------------------------

/// Network behaviour that denies outbound connections to local addresses.
///
/// Installed behind a `Toggle`, so it only exists when the feature is on.
#[derive(Debug, Default)]
pub struct LocalDialGate {
    denied: u64,
}

impl LocalDialGate {
    /// Creates the gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections denied so far.
    pub fn denied(&self) -> u64 {
        self.denied
    }

    fn deny(&mut self, peer: Option<PeerId>, addr: &Multiaddr) -> ConnectionDenied {
        self.denied += 1;
        tracing::info!(peer = ?peer, %addr, "local dial blocked by connection gate");
        ConnectionDenied::new(LocalDialBlocked { addr: addr.clone() })
    }
}

impl NetworkBehaviour for LocalDialGate {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(dummy::ConnectionHandler)
    }

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        // Explicit addresses that are all local: refuse the whole dial.
        // Mixed sets pass here and are checked per connection below.
        if let Some(first) = addresses.first() {
            if addresses.iter().all(is_local_multiaddr) {
                return Err(self.deny(maybe_peer, first));
            }
        }
        Ok(Vec::new())
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        if is_local_multiaddr(addr) {
            return Err(self.deny(Some(peer), addr));
        }
        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        _event: THandlerOutEvent<Self>,
    ) {
    }

    fn poll(&mut self, _cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

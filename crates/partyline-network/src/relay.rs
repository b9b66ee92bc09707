//! Circuit Relay v2 support for NAT traversal.
//!
//! The relay client is built into the transport via
//! `SwarmBuilder::with_relay_client`. At startup the host listens on
//! `<relay>/p2p-circuit` for every configured relay, which asks the relay
//! for a reservation. Once a reservation is accepted the swarm reports a
//! relayed listen address, and [`wait_for_relay_address`] lets startup
//! block until that happens.

use std::future::Future;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::relay;
use libp2p::{Multiaddr, PeerId};

use partyline_types::{PartyLineError, Result};

// ---------------------------------------------------------------------------
// Relay address helpers
// ---------------------------------------------------------------------------

/// Reservation address for listening through a relay.
///
/// `relay_addr` must end in `/p2p/<relay_peer_id>`.
/// Produces: `{relay_addr}/p2p-circuit`
///
/// # Errors
///
/// Returns `ConfigError` if `relay_addr` has no relay peer id.
pub fn build_relay_listen_addr(relay_addr: &Multiaddr) -> Result<Multiaddr> {
    if extract_relay_peer_id(relay_addr).is_none() {
        return Err(PartyLineError::ConfigError {
            reason: format!("relay address {relay_addr} is missing /p2p/<relay_id>"),
        });
    }
    Ok(relay_addr.clone().with(Protocol::P2pCircuit))
}

/// Circuit address for reaching `target` through a relay.
///
/// Produces: `{relay_addr}/p2p-circuit/p2p/{target}`
///
/// # Errors
///
/// Returns `ConfigError` if `relay_addr` has no relay peer id.
pub fn build_relay_circuit_addr(relay_addr: &Multiaddr, target: &PeerId) -> Result<Multiaddr> {
    Ok(build_relay_listen_addr(relay_addr)?.with(Protocol::P2p(*target)))
}

/// Extracts the relay PeerId from a relay multiaddr.
///
/// Looks for the first `/p2p/` component in the address.
pub fn extract_relay_peer_id(relay_addr: &Multiaddr) -> Option<PeerId> {
    relay_addr.iter().find_map(|proto| match proto {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Returns whether `addr` goes through a relay circuit.
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

// ---------------------------------------------------------------------------
// Reachability poll
// ---------------------------------------------------------------------------

/// Polls `listen_addrs` every `interval` until one address is relayed.
///
/// The first check happens after one interval, giving the reservation
/// time to complete. Returns the relayed address found.
///
/// # Errors
///
/// - `StartupFatal` after `max_attempts` checks without a relayed address.
/// - Any error returned by `listen_addrs` itself.
pub async fn wait_for_relay_address<F, Fut>(
    mut listen_addrs: F,
    interval: Duration,
    max_attempts: u32,
) -> Result<Multiaddr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<Multiaddr>>>,
{
    for attempt in 1..=max_attempts {
        tokio::time::sleep(interval).await;
        let addrs = listen_addrs().await?;
        if let Some(relayed) = addrs.into_iter().find(is_relayed) {
            tracing::info!(%relayed, attempt, "acquired relayed address");
            return Ok(relayed);
        }
        tracing::debug!(attempt, max_attempts, "no relayed address yet");
    }

    Err(PartyLineError::StartupFatal {
        reason: format!(
            "no relay reservation after {max_attempts} checks ({}s apart)",
            interval.as_secs()
        ),
    })
}

// ---------------------------------------------------------------------------
// Relay event logging
// ---------------------------------------------------------------------------

/// Logs relay client events at appropriate levels.
pub fn log_relay_client_event(event: &relay::client::Event) {
    match event {
        relay::client::Event::ReservationReqAccepted {
            relay_peer_id,
            renewal,
            ..
        } => {
            tracing::info!(%relay_peer_id, renewal, "relay reservation accepted");
        }
        relay::client::Event::OutboundCircuitEstablished { relay_peer_id, .. } => {
            tracing::info!(%relay_peer_id, "outbound relay circuit established");
        }
        relay::client::Event::InboundCircuitEstablished { src_peer_id, .. } => {
            tracing::info!(%src_peer_id, "inbound relay circuit established");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn listen_and_circuit_addrs() -> TestResult {
        let relay_peer = PeerId::random();
        let target = PeerId::random();
        let relay_addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/4001/p2p/{relay_peer}").parse()?;

        let listen = build_relay_listen_addr(&relay_addr)?;
        assert_eq!(listen.to_string(), format!("{relay_addr}/p2p-circuit"));
        assert!(is_relayed(&listen));

        let circuit = build_relay_circuit_addr(&relay_addr, &target)?;
        assert_eq!(circuit.to_string(), format!("{relay_addr}/p2p-circuit/p2p/{target}"));
        Ok(())
    }

    #[test]
    fn relay_without_peer_id_rejected() -> TestResult {
        let relay_addr: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse()?;
        assert!(build_relay_listen_addr(&relay_addr).is_err());
        assert!(extract_relay_peer_id(&relay_addr).is_none());
        Ok(())
    }

    #[test]
    fn direct_addr_is_not_relayed() -> TestResult {
        assert!(!is_relayed(&"/ip4/1.2.3.4/udp/1/quic-v1".parse()?));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_once_relayed_address_appears() -> TestResult {
        let relay_peer = PeerId::random();
        let relayed: Multiaddr =
            format!("/ip4/1.2.3.4/tcp/4001/p2p/{relay_peer}/p2p-circuit").parse()?;
        let direct: Multiaddr = "/ip4/10.0.0.2/tcp/5000".parse()?;
        let calls = Arc::new(AtomicU32::new(0));

        let found = {
            let calls = Arc::clone(&calls);
            let relayed = relayed.clone();
            wait_for_relay_address(
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    let mut addrs = vec![direct.clone()];
                    if n >= 2 {
                        addrs.push(relayed.clone());
                    }
                    async move { Ok(addrs) }
                },
                Duration::from_secs(5),
                10,
            )
            .await?
        };
        assert_eq!(found, relayed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_after_max_attempts() {
        let start = tokio::time::Instant::now();
        let result =
            wait_for_relay_address(|| async { Ok(Vec::new()) }, Duration::from_secs(5), 3).await;
        assert!(matches!(result, Err(PartyLineError::StartupFatal { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }
}

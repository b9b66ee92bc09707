//! Hole punching through DCUtR (Direct Connection Upgrade through Relay).
//!
//! DCUtR is part of the swarm behaviour. When a connection to a peer is
//! established through a relay circuit, DCUtR coordinates a simultaneous
//! dial and, if the NATs on both sides cooperate, replaces the relayed
//! connection with a direct one. No explicit call is needed: the host
//! only reports the outcome.

use libp2p::dcutr;
use libp2p::PeerId;

/// Logs a DCUtR event.
///
/// Returns `Some(peer_id)` if a direct connection upgrade succeeded,
/// `None` otherwise. A failed upgrade is not an error: the session keeps
/// running over the relay.
pub fn handle_dcutr_event(event: dcutr::Event) -> Option<PeerId> {
    let remote_peer_id = event.remote_peer_id;

    match event.result {
        Ok(direct_conn_id) => {
            tracing::info!(
                %remote_peer_id,
                ?direct_conn_id,
                "DCUtR: direct connection upgrade succeeded (hole punch)"
            );
            Some(remote_peer_id)
        }
        Err(error) => {
            tracing::warn!(
                %remote_peer_id,
                ?error,
                "DCUtR: direct connection upgrade failed; staying on relay"
            );
            None
        }
    }
}

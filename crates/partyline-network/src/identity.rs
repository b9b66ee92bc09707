//! Local peer identity.
//!
//! Every Party Line process runs with one Ed25519 libp2p keypair for its
//! whole lifetime. The derived `PeerId` is the identity carried in the
//! `Hello` record and in [`UserInfo::peer_id`](partyline_types::UserInfo).

use libp2p::identity;
use libp2p::PeerId;

use partyline_types::{PartyLineError, Result, UserInfo};

/// Generates a fresh random Ed25519 identity.
pub fn generate_identity() -> identity::Keypair {
    identity::Keypair::generate_ed25519()
}

/// Builds an Ed25519 identity from a 32-byte secret seed.
///
/// # Determinism
///
/// The same seed always yields the same `PeerId`.
///
/// # Errors
///
/// Returns `ConfigError` if libp2p rejects the seed.
pub fn keypair_from_seed(seed: [u8; 32]) -> Result<identity::Keypair> {
    identity::Keypair::ed25519_from_bytes(seed).map_err(|e| PartyLineError::ConfigError {
        reason: format!("invalid ed25519 seed: {e}"),
    })
}

/// Extracts the `PeerId` from a libp2p `Keypair`.
pub fn peer_id_from_keypair(keypair: &identity::Keypair) -> PeerId {
    PeerId::from(keypair.public())
}

/// Parses the textual form of a `PeerId`.
///
/// # Errors
///
/// Returns `ProtocolViolation` if `s` is not a valid peer id.
pub fn parse_peer_id(s: &str) -> Result<PeerId> {
    s.parse::<PeerId>().map_err(|e| PartyLineError::ProtocolViolation {
        reason: format!("invalid peer id '{s}': {e}"),
    })
}

/// Builds the [`UserInfo`] announced for `peer_id`.
pub fn user_info(peer_id: &PeerId, nickname: &str) -> UserInfo {
    UserInfo::new(peer_id.to_base58(), nickname)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_identity_is_deterministic() -> Result<()> {
        let a = peer_id_from_keypair(&keypair_from_seed([0x42; 32])?);
        let b = peer_id_from_keypair(&keypair_from_seed([0x42; 32])?);
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn different_seeds_produce_different_peer_ids() -> Result<()> {
        let a = peer_id_from_keypair(&keypair_from_seed([0x01; 32])?);
        let b = peer_id_from_keypair(&keypair_from_seed([0x02; 32])?);
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn peer_id_text_round_trip() -> Result<()> {
        let peer_id = peer_id_from_keypair(&generate_identity());
        assert_eq!(parse_peer_id(&peer_id.to_base58())?, peer_id);
        Ok(())
    }

    #[test]
    fn legacy_rsa_style_id_parses() {
        assert!(parse_peer_id("Qma71QQyJN7Sw7gz1cgJ4C66ubHmvKqBasSegKRugM5qo6").is_ok());
    }

    #[test]
    fn garbage_peer_id_rejected() {
        assert!(matches!(
            parse_peer_id("not-a-peer"),
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn user_info_uses_base58() {
        let peer_id = peer_id_from_keypair(&generate_identity());
        let user = user_info(&peer_id, "alice");
        assert_eq!(user.peer_id, peer_id.to_string());
        assert_eq!(user.nickname, "alice");
    }
}

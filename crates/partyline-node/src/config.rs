//! Node configuration: everything needed to bring one participant up.

use serde::{Deserialize, Serialize};

use partyline_network::NetworkConfig;
use partyline_types::config::HubConfig;
use partyline_types::{PartyLineError, Result};

/// Maximum nickname length in characters.
pub const MAX_NICKNAME_LEN: usize = 64;

/// Top-level node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Nickname announced in every `Hello`.
    pub nickname: String,
    /// Event hub queues and broadcast policy.
    pub hub: HubConfig,
    /// Network layer settings.
    pub network: NetworkConfig,
    /// Targets (peer ids or multiaddrs) to connect to after startup.
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".into(),
            hub: HubConfig::default(),
            network: NetworkConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Validates the node configuration and its sections.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty or overlong nickname, or any
    /// error from the hub and network sections.
    pub fn validate(&self) -> Result<()> {
        let nickname = self.nickname.trim();
        if nickname.is_empty() {
            return Err(PartyLineError::ConfigError {
                reason: "nickname must not be empty".into(),
            });
        }
        if nickname.chars().count() > MAX_NICKNAME_LEN {
            return Err(PartyLineError::ConfigError {
                reason: format!("nickname longer than {MAX_NICKNAME_LEN} characters"),
            });
        }
        self.hub.validate()?;
        self.network.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn blank_nickname_rejected() {
        let config = NodeConfig {
            nickname: "   ".into(),
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(PartyLineError::ConfigError { .. })));
    }

    #[test]
    fn long_nickname_rejected() {
        let config = NodeConfig {
            nickname: "x".repeat(MAX_NICKNAME_LEN + 1),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hub_errors_propagate() {
        let mut config = NodeConfig::default();
        config.hub.listener_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() -> std::result::Result<(), serde_json::Error> {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "nickname": "alice", "peers": ["12D3KooWabc"] }"#)?;
        assert_eq!(config.nickname, "alice");
        assert_eq!(config.peers, vec!["12D3KooWabc".to_string()]);
        assert_eq!(config.hub.outgoing_queue_capacity, 1024);
        Ok(())
    }
}

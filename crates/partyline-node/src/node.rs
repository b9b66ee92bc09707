//! Node lifecycle and state machine.
//!
//! The [`Node`] is the public entry point for the Party Line runtime.
//! It owns the event hub, the recording store and, once started, the
//! peer manager.
//!
//! # State machine
//!
//! ```text
//! Initializing ──start()──▶ Running ──shutdown()──▶ ShuttingDown ──▶ (dropped)
//! ```
//!
//! - `Initializing`: hub and store created, not on the network yet.
//! - `Running`: hub worker, fan-out router and stream acceptor active.
//! - `ShuttingDown`: background tasks stopped.
//!
//! Double-start and shutdown-from-initializing are rejected with
//! `PartyLineError::ConfigError`.

use std::sync::Arc;

use libp2p::identity::Keypair;
use tokio::task::JoinHandle;

use partyline_hub::{Dispatcher, DispatcherWorker, PublishQueue};
use partyline_network::identity::{generate_identity, user_info};
use partyline_network::PeerManager;
use partyline_storage::MemoryRecordingStore;
use partyline_types::{Attachment, Message, PartyLineError, Result, UserInfo};

use crate::config::NodeConfig;
use crate::connect::{connect_initial_peers, serve_connect_requests, CONNECT_LISTENER_ID};

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Components created, not yet on the network.
    Initializing,
    /// Startup sequence completed.
    Running,
    /// Shutdown requested.
    ShuttingDown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Parts consumed by [`Node::start`].
struct Pending {
    keypair: Keypair,
    worker: DispatcherWorker,
    publish: PublishQueue,
}

/// A Party Line participant.
pub struct Node {
    state: NodeState,
    config: NodeConfig,
    local_user: UserInfo,
    hub: Dispatcher,
    store: Arc<MemoryRecordingStore>,
    pending: Option<Pending>,
    network: Option<Arc<PeerManager>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Creates a node with a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` is invalid.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_keypair(config, generate_identity())
    }

    /// Creates a node with the given identity.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` is invalid.
    pub fn with_keypair(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        config.validate()?;

        let (hub, worker, publish) = Dispatcher::new(&config.hub)?;
        let local_user = user_info(&keypair.public().to_peer_id(), config.nickname.trim());

        Ok(Self {
            state: NodeState::Initializing,
            config,
            local_user,
            hub,
            store: Arc::new(MemoryRecordingStore::new()),
            pending: Some(Pending {
                keypair,
                worker,
                publish,
            }),
            network: None,
            tasks: Vec::new(),
        })
    }

    /// Starts the hub worker, runs the network startup sequence, then
    /// begins serving connect requests and dials the configured peers.
    ///
    /// Transitions `Initializing → Running`.
    ///
    /// # Errors
    ///
    /// - `ConfigError` if the node is not in `Initializing` state.
    /// - Any startup error from the network layer. The hub is stopped
    ///   again in that case and the node cannot be restarted.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != NodeState::Initializing {
            return Err(PartyLineError::ConfigError {
                reason: format!(
                    "cannot start node in state '{}'; expected 'initializing'",
                    self.state,
                ),
            });
        }
        let Pending {
            keypair,
            worker,
            publish,
        } = self.pending.take().ok_or_else(|| PartyLineError::ConfigError {
            reason: "node already started once".into(),
        })?;

        let hub_task = tokio::spawn(worker.run());

        let started = PeerManager::start(
            self.config.network.clone(),
            keypair,
            &self.local_user.nickname,
            self.hub.clone(),
            self.store.clone(),
            publish,
        )
        .await;
        let network = match started {
            Ok(network) => Arc::new(network),
            Err(error) => {
                self.hub.shutdown();
                hub_task.abort();
                return Err(error);
            }
        };

        let requests = self.hub.register_listener(CONNECT_LISTENER_ID);
        let requests_task = tokio::spawn(serve_connect_requests(requests, {
            let network = Arc::clone(&network);
            move |target: String| {
                let network = Arc::clone(&network);
                async move { network.connect_to_peer(&target).await }
            }
        }));
        self.tasks.push(hub_task);
        self.tasks.push(requests_task);

        if !self.config.peers.is_empty() {
            let peers = self.config.peers.clone();
            let dialer = Arc::clone(&network);
            self.tasks.push(tokio::spawn(async move {
                connect_initial_peers(&peers, |target| {
                    let dialer = Arc::clone(&dialer);
                    async move { dialer.connect_to_peer(&target).await }
                })
                .await;
            }));
        }

        self.network = Some(network);
        self.state = NodeState::Running;
        tracing::info!(user = %self.local_user, "node running");
        Ok(())
    }

    /// Stops the network layer and the hub.
    ///
    /// Idempotent once shutting down.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the node was never started.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            NodeState::Initializing => {
                return Err(PartyLineError::ConfigError {
                    reason: "cannot shutdown a node that has not been started".into(),
                })
            }
            NodeState::ShuttingDown => return Ok(()),
            NodeState::Running => {}
        }
        self.state = NodeState::ShuttingDown;

        if let Some(network) = &self.network {
            network.shutdown();
        }
        self.hub.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("node shut down");
        Ok(())
    }

    /// Submits a message authored by this node for broadcast.
    ///
    /// # Errors
    ///
    /// Returns `HubClosed` once the hub has stopped.
    pub async fn send_message(&self, text: Option<String>, attachments: Vec<Attachment>) -> Result<()> {
        let mut msg = Message::new(self.local_user.clone(), text);
        msg.attachments = attachments;
        self.hub.submit_outgoing(msg).await
    }

    /// Connects to `target` (peer id or multiaddr).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` before [`start`](Self::start) and otherwise
    /// whatever [`PeerManager::connect_to_peer`] returns.
    pub async fn connect_to_peer(&self, target: &str) -> Result<UserInfo> {
        match &self.network {
            Some(network) => network.connect_to_peer(target).await,
            None => Err(PartyLineError::ConfigError {
                reason: "node is not running".into(),
            }),
        }
    }

    /// The event hub. Register listeners here.
    pub fn hub(&self) -> &Dispatcher {
        &self.hub
    }

    /// The audio store shared with the network layer.
    pub fn store(&self) -> &Arc<MemoryRecordingStore> {
        &self.store
    }

    /// This node's identity and nickname.
    pub fn local_user(&self) -> &UserInfo {
        &self.local_user
    }

    /// The peer manager, once running.
    pub fn network(&self) -> Option<&Arc<PeerManager>> {
        self.network.as_ref()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use partyline_network::identity::keypair_from_seed;
    use partyline_types::EventKind;

    use super::*;

    fn config(nickname: &str) -> NodeConfig {
        NodeConfig {
            nickname: nickname.into(),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn new_node_is_initializing() -> Result<()> {
        let keypair = keypair_from_seed([7u8; 32])?;
        let peer_id = keypair.public().to_peer_id();
        let node = Node::with_keypair(config(" alice "), keypair)?;

        assert_eq!(node.state(), NodeState::Initializing);
        assert_eq!(node.local_user().nickname, "alice");
        assert_eq!(node.local_user().peer_id, peer_id.to_base58());
        assert!(node.network().is_none());
        Ok(())
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(matches!(
            Node::new(config("")),
            Err(PartyLineError::ConfigError { .. })
        ));
    }

    #[test]
    fn shutdown_before_start_rejected() -> Result<()> {
        let mut node = Node::new(config("alice"))?;
        assert!(node.shutdown().is_err());
        assert_eq!(node.state(), NodeState::Initializing);
        Ok(())
    }

    #[tokio::test]
    async fn connect_before_start_rejected() -> Result<()> {
        let node = Node::new(config("alice"))?;
        let result = node.connect_to_peer("12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN").await;
        assert!(matches!(result, Err(PartyLineError::ConfigError { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn send_message_is_authored_locally() -> Result<()> {
        let mut node = Node::new(config("alice"))?;
        let mut events = node.hub().register_listener("test");

        // Run only the hub worker; the network is not needed to see the echo.
        let pending = node.pending.take().ok_or_else(|| PartyLineError::ConfigError {
            reason: "missing worker".into(),
        })?;
        tokio::spawn(pending.worker.run());

        node.send_message(Some("hello".into()), vec![Attachment::audio("rec")])
            .await?;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        match event {
            Ok(Some(event)) => match event.kind {
                EventKind::MessageSent(msg) => {
                    assert_eq!(&msg.author, node.local_user());
                    assert_eq!(msg.text.as_deref(), Some("hello"));
                    assert_eq!(msg.attachments, vec![Attachment::audio("rec")]);
                }
                other => panic!("expected msg-sent, got {other:?}"),
            },
            other => panic!("expected an event, got {other:?}"),
        }
        Ok(())
    }
}

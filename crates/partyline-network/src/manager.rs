//! Peer connectivity manager.
//!
//! [`PeerManager::start`] brings the node onto the network in a fixed
//! order and fails with a startup error if any step fails:
//!
//! 1. build the host (identity, transports, relay client, hole punching)
//!    and listen on the configured local addresses;
//! 2. install the local dial gate when `block_local_dials` is set;
//! 3. bootstrap the DHT in client mode;
//! 4. reserve a slot on every relay and poll until a relayed address
//!    shows up;
//! 5. wait a bounded time for NAT classification.
//!
//! After that the manager accepts inbound chat streams, runs the fan-out
//! router and serves [`PeerManager::connect_to_peer`].

use std::sync::Arc;
use std::time::Duration;

use futures::io::AsyncReadExt;
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use tokio::task::JoinHandle;

use partyline_hub::{Dispatcher, PublishQueue};
use partyline_storage::RecordingStore;
use partyline_types::{PartyLineError, Result, UserInfo};

use crate::config::NetworkConfig;
use crate::discovery::extract_peer_id;
use crate::fanout::FanoutRouter;
use crate::gate::dialable_addrs;
use crate::host::{Host, HostHandle};
use crate::identity::{parse_peer_id, user_info};
use crate::nat::await_nat_classification;
use crate::protocol::CHAT_PROTOCOL;
use crate::registry::PeerRegistry;
use crate::relay::{build_relay_circuit_addr, wait_for_relay_address};
use crate::session::{Direction, SessionContext};

// ---------------------------------------------------------------------------
// Dial targets
// ---------------------------------------------------------------------------

/// A parsed `ConnectToPeer` target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialTarget {
    /// Peer to connect to.
    pub peer: PeerId,
    /// Address given with the target, without its trailing `/p2p`.
    pub addr: Option<Multiaddr>,
}

/// Parses a bare peer id (`12D3KooW...`) or a multiaddr ending in
/// `/p2p/<peer id>`.
///
/// # Errors
///
/// Returns `PeerUnreachable` if the target is neither.
pub fn parse_dial_target(target: &str) -> Result<DialTarget> {
    let target = target.trim();
    if target.starts_with('/') {
        let addr: Multiaddr = target.parse().map_err(|e| PartyLineError::PeerUnreachable {
            reason: format!("invalid address '{target}': {e}"),
        })?;
        let (peer, addr) = extract_peer_id(&addr).ok_or_else(|| PartyLineError::PeerUnreachable {
            reason: format!("address '{target}' does not end in /p2p/<peer id>"),
        })?;
        let addr = (!addr.is_empty()).then_some(addr);
        return Ok(DialTarget { peer, addr });
    }

    let peer = parse_peer_id(target).map_err(|e| PartyLineError::PeerUnreachable {
        reason: e.to_string(),
    })?;
    Ok(DialTarget { peer, addr: None })
}

// ---------------------------------------------------------------------------
// PeerManager
// ---------------------------------------------------------------------------

/// The local node's network presence.
pub struct PeerManager {
    host: HostHandle,
    ctx: SessionContext,
    local_user: UserInfo,
    addresses: Vec<Multiaddr>,
    relays: Vec<Multiaddr>,
    block_local_dials: bool,
    dial_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerManager {
    /// Runs the startup sequence and returns the running manager.
    ///
    /// `publish` is the hub's publish queue; the manager's fan-out
    /// router becomes its only consumer.
    ///
    /// # Errors
    ///
    /// - `ConfigError` if `config` is invalid.
    /// - `StartupFatal` if the host cannot be built or bound, the DHT
    ///   cannot be bootstrapped or no relay reservation arrives.
    /// - `NatDiagnosticTimeout` if NAT classification does not complete.
    pub async fn start(
        config: NetworkConfig,
        keypair: Keypair,
        nickname: &str,
        dispatcher: Dispatcher,
        store: Arc<dyn RecordingStore>,
        publish: PublishQueue,
    ) -> Result<Self> {
        config.validate()?;

        let (mut host, handle, mut nat_reports) = Host::new(&keypair, &config)?;
        let local_peer_id = handle.local_peer_id();

        host.listen(&config.listen_addrs)?;
        host.bootstrap(&config.effective_bootstrap_nodes())?;
        let relays = config.effective_relay_servers();
        host.reserve_relays(&relays)?;

        let incoming = handle
            .control()
            .accept(CHAT_PROTOCOL)
            .map_err(|e| PartyLineError::StartupFatal {
                reason: format!("chat protocol already registered: {e}"),
            })?;
        let host_task = tokio::spawn(host.run());

        let reachability = async {
            if relays.is_empty() {
                tracing::warn!("no relays configured; skipping relay reachability check");
            } else {
                let handle_ref = &handle;
                wait_for_relay_address(
                    move || handle_ref.listen_addrs(),
                    Duration::from_secs(config.relay_poll_interval_secs),
                    config.relay_poll_max_attempts,
                )
                .await?;
            }

            let addresses = handle.listen_addrs().await?;
            tracing::info!(peer_id = %local_peer_id, "local identity");
            for addr in &addresses {
                let full = addr.clone().with_p2p(local_peer_id).unwrap_or_else(|a| a);
                tracing::info!(address = %full, "reachable at");
            }

            if config.nat_transports > 0 {
                await_nat_classification(
                    &mut nat_reports,
                    config.nat_transports,
                    Duration::from_secs(config.nat_diagnostic_timeout_secs),
                )
                .await?;
            }
            Ok::<_, PartyLineError>(addresses)
        };
        let addresses = match reachability.await {
            Ok(addresses) => addresses,
            Err(error) => {
                host_task.abort();
                return Err(error);
            }
        };

        let registry = Arc::new(PeerRegistry::new(config.outbound_queue_capacity));
        let ctx = SessionContext::new(
            &local_peer_id,
            nickname,
            dispatcher,
            Arc::clone(&registry),
            Arc::clone(&store),
            config.handshake_timeout(),
        );

        let router = FanoutRouter::new(registry, store);
        let router_task = tokio::spawn(router.run(publish));
        let accept_task = tokio::spawn(accept_loop(incoming, ctx.clone()));

        tracing::info!(
            peer_id = %local_peer_id,
            nickname,
            "peer manager started"
        );

        Ok(Self {
            host: handle,
            ctx,
            local_user: user_info(&local_peer_id, nickname),
            addresses,
            relays,
            block_local_dials: config.block_local_dials,
            dial_timeout: config.dial_timeout(),
            tasks: vec![host_task, router_task, accept_task],
        })
    }

    /// This node's identity and nickname.
    pub fn local_user(&self) -> &UserInfo {
        &self.local_user
    }

    /// This node's peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    /// Addresses reported at the end of startup.
    pub fn addresses(&self) -> &[Multiaddr] {
        &self.addresses
    }

    /// Peers with a live chat session.
    pub fn session_peers(&self) -> Vec<PeerId> {
        self.ctx.registry().peers()
    }

    /// Peers with at least one open transport connection.
    ///
    /// # Errors
    ///
    /// Returns `StreamIo` if the host has stopped.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.host.connected_peers().await
    }

    /// Opens a chat session to `target`, a bare peer id or a multiaddr
    /// ending in `/p2p/<peer id>`.
    ///
    /// A multiaddr is dialed directly. A bare peer id starts a DHT lookup
    /// and is dialed through a circuit on every configured relay. With
    /// `block_local_dials`, local candidates are dropped before dialing.
    /// The session keeps running on its own task after this returns.
    ///
    /// # Errors
    ///
    /// - `PeerUnreachable` if the target is malformed or this node, the
    ///   gate rejects every candidate, or no stream opens within the dial
    ///   timeout.
    /// - `HandshakeFailed` if the stream opens but the handshake fails.
    pub async fn connect_to_peer(&self, target: &str) -> Result<UserInfo> {
        let DialTarget { peer, addr } = parse_dial_target(target)?;
        if peer == self.local_peer_id() {
            return Err(PartyLineError::PeerUnreachable {
                reason: "refusing to connect to this node".into(),
            });
        }

        let candidates = match addr {
            Some(addr) => {
                let allowed = dialable_addrs(std::slice::from_ref(&addr), self.block_local_dials);
                if allowed.is_empty() {
                    return Err(PartyLineError::PeerUnreachable {
                        reason: format!("{addr} is a local address and local dials are blocked"),
                    });
                }
                allowed
            }
            None => {
                self.host.lookup_peer(peer).await?;
                let circuits: Vec<Multiaddr> = self
                    .relays
                    .iter()
                    .filter_map(|relay| build_relay_circuit_addr(relay, &peer).ok())
                    .collect();
                dialable_addrs(&circuits, self.block_local_dials)
            }
        };
        tracing::info!(%peer, candidates = candidates.len(), "opening chat stream");
        let mut control = self.host.control();
        // The stream reuses the connection the host dial brought up.
        let open = async {
            self.host.dial(peer, candidates).await?;
            control
                .open_stream(peer, CHAT_PROTOCOL)
                .await
                .map_err(|error| PartyLineError::PeerUnreachable {
                    reason: format!("could not open stream to {peer}: {error}"),
                })
        };
        let stream = match tokio::time::timeout(self.dial_timeout, open).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PartyLineError::PeerUnreachable {
                    reason: format!(
                        "dial to {peer} timed out after {}s",
                        self.dial_timeout.as_secs()
                    ),
                })
            }
        };

        let (reader, writer) = stream.split();
        let session = self
            .ctx
            .establish(peer, Direction::Outbound, reader, writer)
            .await?;
        let remote = session.remote().clone();
        session.spawn();
        Ok(remote)
    }

    /// Stops the host, the router and the stream acceptor. Running
    /// sessions end when their streams close.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!("peer manager stopped");
    }
}

async fn accept_loop(mut incoming: libp2p_stream::IncomingStreams, ctx: SessionContext) {
    while let Some((peer, stream)) = incoming.next().await {
        tracing::debug!(%peer, "inbound chat stream");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.split();
            match ctx.establish(peer, Direction::Inbound, reader, writer).await {
                Ok(session) => {
                    let _ = session.run().await;
                }
                Err(error) => tracing::warn!(%peer, %error, "inbound handshake failed"),
            }
        });
    }
    tracing::debug!("stream acceptor stopped");
}

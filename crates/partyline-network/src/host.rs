//! The libp2p host: composite behaviour, swarm construction and the
//! task that drives the swarm.
//!
//! The swarm is owned by a single [`Host`] task. Everything else talks to
//! it through a cloneable [`HostHandle`]: commands go over a channel and
//! chat streams are opened and accepted through the `libp2p-stream`
//! control, which never needs the swarm itself.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{autonat, dcutr, identify, kad, noise, relay, yamux, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot};

use partyline_types::PartyLineError;

use crate::config::NetworkConfig;
use crate::discovery::{build_discovery_behaviour, DiscoveryBehaviour, DiscoveryBehaviourEvent};
use crate::gate::{dialable_addrs, LocalDialGate};
use crate::hole_punch::handle_dcutr_event;
use crate::nat::{build_autonat_config, NatManager, NatReport};
use crate::relay::{build_relay_listen_addr, is_relayed, log_relay_client_event};
use crate::transport;

/// The `#[derive(NetworkBehaviour)]` macro expands to code that names
/// `Result` unqualified, so this module never shadows it in signatures
/// the macro touches.
type BResult<T> = std::result::Result<T, PartyLineError>;

/// Capacity of the command channel into the host task.
const COMMAND_CAPACITY: usize = 64;

/// Capacity of the NAT report channel. Reports beyond it are dropped.
const NAT_REPORT_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Composite behaviour
// ---------------------------------------------------------------------------

/// Every protocol the Party Line host runs.
///
/// The generated `PartyLineBehaviourEvent` has one variant per field.
#[derive(NetworkBehaviour)]
pub struct PartyLineBehaviour {
    /// Local dial gate, present only with `block_local_dials`.
    pub gate: Toggle<LocalDialGate>,
    /// Relay client: reservations and relayed dials.
    pub relay_client: relay::client::Behaviour,
    /// Hole punching over relayed connections.
    pub dcutr: dcutr::Behaviour,
    /// Reachability probing.
    pub autonat: autonat::Behaviour,
    /// Kademlia (client mode) + Identify.
    pub discovery: DiscoveryBehaviour,
    /// Raw chat streams.
    pub stream: libp2p_stream::Behaviour,
}

fn build_behaviour(
    keypair: &Keypair,
    relay_client: relay::client::Behaviour,
    config: &NetworkConfig,
) -> BResult<PartyLineBehaviour> {
    let local_peer_id = keypair.public().to_peer_id();
    let gate = config.block_local_dials.then(LocalDialGate::new);

    Ok(PartyLineBehaviour {
        gate: Toggle::from(gate),
        relay_client,
        dcutr: dcutr::Behaviour::new(local_peer_id),
        autonat: autonat::Behaviour::new(
            local_peer_id,
            build_autonat_config(config.autonat_confidence_max),
        ),
        discovery: build_discovery_behaviour(keypair, config)?,
        stream: libp2p_stream::Behaviour::new(),
    })
}

/// Builds the swarm: TCP and QUIC with DNS, the relay client transport
/// and [`PartyLineBehaviour`].
///
/// # Errors
///
/// Returns `StartupFatal` if any transport or behaviour fails to build.
pub fn build_swarm(keypair: &Keypair, config: &NetworkConfig) -> BResult<Swarm<PartyLineBehaviour>> {
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(transport::tcp_config(), noise::Config::new, yamux::Config::default)
        .map_err(|e| startup_fatal(format!("failed to configure TCP transport: {e}")))?
        .with_quic_config(|mut quic| {
            quic.keep_alive_interval = transport::KEEP_ALIVE_INTERVAL;
            quic
        })
        .with_dns()
        .map_err(|e| startup_fatal(format!("failed to configure DNS resolution: {e}")))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| startup_fatal(format!("failed to configure relay transport: {e}")))?
        .with_behaviour(|key, relay_client| {
            build_behaviour(key, relay_client, config)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
        .map_err(|e| startup_fatal(format!("failed to build network behaviour: {e}")))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

fn startup_fatal(reason: String) -> PartyLineError {
    PartyLineError::StartupFatal { reason }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum HostCommand {
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<BResult<()>>,
    },
    LookupPeer {
        peer: PeerId,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// Cloneable handle to a running [`Host`].
#[derive(Clone)]
pub struct HostHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<HostCommand>,
    control: libp2p_stream::Control,
}

impl HostHandle {
    /// This node's peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// A stream control for opening and accepting chat streams.
    pub fn control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Current listen addresses plus confirmed external addresses.
    ///
    /// # Errors
    ///
    /// Returns `StreamIo` if the host task has stopped.
    pub async fn listen_addrs(&self) -> BResult<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::ListenAddrs { reply }).await?;
        rx.await.map_err(|_| host_stopped())
    }

    /// Peers with at least one open connection.
    ///
    /// # Errors
    ///
    /// Returns `StreamIo` if the host task has stopped.
    pub async fn connected_peers(&self) -> BResult<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::ConnectedPeers { reply }).await?;
        rx.await.map_err(|_| host_stopped())
    }

    /// Dials `peer` and waits until a connection is up. Returns at once
    /// if one already is.
    ///
    /// With `block_local_dials` only the non-local entries of `addrs` are
    /// tried, and addresses known to other behaviours are not added, so
    /// no local path is ever attempted. Otherwise `addrs` is extended
    /// with whatever the DHT knows about `peer`.
    ///
    /// # Errors
    ///
    /// - `PeerUnreachable` if nothing is left to dial or the dial fails.
    /// - `StreamIo` if the host task has stopped.
    pub async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Dial { peer, addrs, reply }).await?;
        rx.await.map_err(|_| host_stopped())?
    }

    /// Starts a DHT lookup for `peer`. Does not wait for the result.
    ///
    /// # Errors
    ///
    /// Returns `StreamIo` if the host task has stopped.
    pub async fn lookup_peer(&self, peer: PeerId) -> BResult<()> {
        self.send(HostCommand::LookupPeer { peer }).await
    }

    async fn send(&self, command: HostCommand) -> BResult<()> {
        self.commands.send(command).await.map_err(|_| host_stopped())
    }
}

fn host_stopped() -> PartyLineError {
    PartyLineError::StreamIo {
        reason: "network host has stopped".into(),
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Owner of the swarm. Configure it, then move it onto a task with
/// [`Host::run`].
pub struct Host {
    swarm: Swarm<PartyLineBehaviour>,
    commands: mpsc::Receiver<HostCommand>,
    nat: NatManager,
    nat_tx: mpsc::Sender<NatReport>,
    kad_protocol: String,
    block_local_dials: bool,
    pending_dials: HashMap<ConnectionId, oneshot::Sender<BResult<()>>>,
}

impl Host {
    /// Builds the swarm for `keypair`.
    ///
    /// Returns the host, a handle to it and the channel NAT
    /// classifications are reported on.
    ///
    /// # Errors
    ///
    /// Returns `StartupFatal` if the swarm cannot be built.
    pub fn new(
        keypair: &Keypair,
        config: &NetworkConfig,
    ) -> BResult<(Self, HostHandle, mpsc::Receiver<NatReport>)> {
        let swarm = build_swarm(keypair, config)?;
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (nat_tx, nat_rx) = mpsc::channel(NAT_REPORT_CAPACITY);

        let handle = HostHandle {
            local_peer_id: *swarm.local_peer_id(),
            commands: commands_tx,
            control: swarm.behaviour().stream.new_control(),
        };
        tracing::info!(
            peer_id = %handle.local_peer_id,
            block_local_dials = config.block_local_dials,
            "network host created"
        );

        let host = Self {
            swarm,
            commands,
            nat: NatManager::new(),
            nat_tx,
            kad_protocol: config.kad_protocol.clone(),
            block_local_dials: config.block_local_dials,
            pending_dials: HashMap::new(),
        };
        Ok((host, handle, nat_rx))
    }

    /// Starts listening on every address in `addrs`.
    ///
    /// # Errors
    ///
    /// Returns `StartupFatal` if an address cannot be bound.
    pub fn listen(&mut self, addrs: &[Multiaddr]) -> BResult<()> {
        for addr in addrs {
            self.swarm
                .listen_on(addr.clone())
                .map_err(|e| startup_fatal(format!("failed to listen on {addr}: {e}")))?;
        }
        Ok(())
    }

    /// Seeds Kademlia with `nodes` and starts a bootstrap. Does nothing
    /// for an empty list.
    ///
    /// # Errors
    ///
    /// Returns `StartupFatal` if no node is usable.
    pub fn bootstrap(&mut self, nodes: &[Multiaddr]) -> BResult<()> {
        if nodes.is_empty() {
            tracing::warn!("no bootstrap nodes configured; DHT lookups will find nothing");
            return Ok(());
        }
        let discovery = &mut self.swarm.behaviour_mut().discovery;
        let added = discovery.add_bootstrap_nodes(nodes)?;
        discovery.bootstrap()?;
        tracing::info!(nodes = added, "DHT bootstrap started");
        Ok(())
    }

    /// Requests a reservation on every relay by listening on its
    /// `/p2p-circuit` address.
    ///
    /// # Errors
    ///
    /// Returns `StartupFatal` if a relay address is unusable.
    pub fn reserve_relays(&mut self, relays: &[Multiaddr]) -> BResult<()> {
        for relay in relays {
            let circuit = build_relay_listen_addr(relay)
                .map_err(|e| startup_fatal(format!("bad relay address {relay}: {e}")))?;
            self.swarm
                .listen_on(circuit.clone())
                .map_err(|e| startup_fatal(format!("failed to listen on {circuit}: {e}")))?;
            tracing::info!(%circuit, "requested relay reservation");
        }
        Ok(())
    }

    /// Drives the swarm until every [`HostHandle`] is dropped.
    pub async fn run(mut self) {
        tracing::debug!("network host task started");
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        tracing::info!("network host stopped");
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::ListenAddrs { reply } => {
                let mut addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
                for external in self.swarm.external_addresses() {
                    if !addrs.contains(external) {
                        addrs.push(external.clone());
                    }
                }
                let _ = reply.send(addrs);
            }
            HostCommand::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),
            HostCommand::LookupPeer { peer } => {
                let query = self.swarm.behaviour_mut().discovery.lookup_peer(peer);
                tracing::debug!(%peer, ?query, "DHT lookup started");
            }
            HostCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
        }
    }

    fn dial(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, reply: oneshot::Sender<BResult<()>>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        let allowed = dialable_addrs(&addrs, self.block_local_dials);
        if self.block_local_dials && allowed.is_empty() {
            let _ = reply.send(Err(PartyLineError::PeerUnreachable {
                reason: format!("no non-local address to dial {peer}"),
            }));
            return;
        }

        let mut opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::Always)
            .addresses(allowed);
        if !self.block_local_dials {
            opts = opts.extend_addresses_through_behaviour();
        }
        let opts = opts.build();
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                tracing::debug!(%peer, ?connection_id, "dialing");
                self.pending_dials.insert(connection_id, reply);
            }
            Err(error) => {
                let _ = reply.send(Err(PartyLineError::PeerUnreachable {
                    reason: format!("could not dial {peer}: {error}"),
                }));
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<PartyLineBehaviourEvent>) {
        match event {
            // --- Connection events ------------------------------------
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, relayed = is_relayed(&address), "new listen address");
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                tracing::info!(%address, "listen address expired");
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                tracing::info!(%address, "external address confirmed");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
                tracing::debug!(
                    %peer_id,
                    address = %endpoint.get_remote_address(),
                    relayed = endpoint.is_relayed(),
                    num_established,
                    "connection established"
                );
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                cause,
                num_established,
                ..
            } => {
                tracing::debug!(%peer_id, ?cause, num_established, "connection closed");
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id,
                connection_id,
                error,
            } => {
                tracing::warn!(?peer_id, %error, "outgoing connection error");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(PartyLineError::PeerUnreachable {
                        reason: format!("dial failed: {error}"),
                    }));
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                tracing::debug!(%send_back_addr, %error, "incoming connection error");
            }

            // --- Behaviour events -------------------------------------
            SwarmEvent::Behaviour(PartyLineBehaviourEvent::RelayClient(event)) => {
                log_relay_client_event(&event);
            }
            SwarmEvent::Behaviour(PartyLineBehaviourEvent::Dcutr(event)) => {
                handle_dcutr_event(event);
            }
            SwarmEvent::Behaviour(PartyLineBehaviourEvent::Autonat(event)) => {
                if let Some(report) = self.nat.on_autonat_event(event) {
                    // Nobody listens once startup is over.
                    let _ = self.nat_tx.try_send(report);
                }
            }
            SwarmEvent::Behaviour(PartyLineBehaviourEvent::Discovery(event)) => {
                self.handle_discovery_event(event);
            }
            SwarmEvent::Behaviour(PartyLineBehaviourEvent::Stream(())) => {}
            SwarmEvent::Behaviour(PartyLineBehaviourEvent::Gate(never)) => match never {},

            other => {
                tracing::trace!(?other, "unhandled swarm event");
            }
        }
    }

    fn handle_discovery_event(&mut self, event: DiscoveryBehaviourEvent) {
        match event {
            DiscoveryBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!(
                    %peer_id,
                    agent = %info.agent_version,
                    observed = %info.observed_addr,
                    "identify received"
                );
                let speaks_kad = info
                    .protocols
                    .iter()
                    .any(|p| p.as_ref() == self.kad_protocol.as_str());
                if speaks_kad {
                    let usable = dialable_addrs(&info.listen_addrs, self.block_local_dials);
                    let discovery = &mut self.swarm.behaviour_mut().discovery;
                    for addr in usable {
                        discovery.add_address(&peer_id, addr);
                    }
                }
            }
            DiscoveryBehaviourEvent::Identify(other) => {
                tracing::trace!(?other, "identify event");
            }
            DiscoveryBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                result, ..
            }) => match result {
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    tracing::debug!(remaining = ok.num_remaining, "DHT bootstrap progressed");
                }
                kad::QueryResult::Bootstrap(Err(error)) => {
                    tracing::warn!(?error, "DHT bootstrap failed");
                }
                kad::QueryResult::GetClosestPeers(Ok(ok)) => {
                    tracing::debug!(peers = ok.peers.len(), "DHT lookup finished");
                }
                kad::QueryResult::GetClosestPeers(Err(error)) => {
                    tracing::debug!(?error, "DHT lookup failed");
                }
                other => {
                    tracing::trace!(?other, "kademlia query progressed");
                }
            },
            DiscoveryBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer, is_new_peer, ..
            }) => {
                tracing::trace!(%peer, is_new_peer, "kademlia routing updated");
            }
            DiscoveryBehaviourEvent::Kademlia(other) => {
                tracing::trace!(?other, "kademlia event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_identity;

    fn local_only() -> NetworkConfig {
        NetworkConfig {
            listen_addrs: vec![],
            use_default_nodes: false,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn host_reports_listen_addresses() -> BResult<()> {
        let keypair = generate_identity();
        let (mut host, handle, _nat) = Host::new(&keypair, &local_only())?;
        assert_eq!(handle.local_peer_id(), keypair.public().to_peer_id());

        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/0"
            .parse()
            .map_err(|e| PartyLineError::ConfigError { reason: format!("{e}") })?;
        host.listen(&[tcp])?;
        let task = tokio::spawn(host.run());

        let mut addrs = Vec::new();
        for _ in 0..50 {
            addrs = handle.listen_addrs().await?;
            if !addrs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(addrs.iter().any(|a| a.to_string().starts_with("/ip4/127.0.0.1/tcp/")));
        assert!(handle.connected_peers().await?.is_empty());

        task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn host_stops_when_handles_dropped() -> BResult<()> {
        let (host, handle, _nat) = Host::new(&generate_identity(), &local_only())?;
        let task = tokio::spawn(host.run());
        drop(handle);
        let joined = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(joined, Ok(Ok(()))));
        Ok(())
    }

    #[tokio::test]
    async fn empty_bootstrap_list_is_allowed() -> BResult<()> {
        let (mut host, _handle, _nat) = Host::new(&generate_identity(), &local_only())?;
        host.bootstrap(&[])?;
        Ok(())
    }

    #[tokio::test]
    async fn relay_without_peer_id_is_fatal() -> BResult<()> {
        let (mut host, _handle, _nat) = Host::new(&generate_identity(), &local_only())?;
        let relay: Multiaddr = "/ip4/54.255.209.104/tcp/12001"
            .parse()
            .map_err(|e| PartyLineError::ConfigError { reason: format!("{e}") })?;
        let result = host.reserve_relays(&[relay]);
        assert!(matches!(result, Err(PartyLineError::StartupFatal { .. })));
        Ok(())
    }

    /// Starts a host listening on loopback TCP and returns its first
    /// listen address.
    async fn listening_host(
        config: NetworkConfig,
    ) -> BResult<(HostHandle, Multiaddr, tokio::task::JoinHandle<()>)> {
        let (mut host, handle, _nat) = Host::new(&generate_identity(), &config)?;
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/0"
            .parse()
            .map_err(|e| PartyLineError::ConfigError { reason: format!("{e}") })?;
        host.listen(&[tcp])?;
        let task = tokio::spawn(host.run());

        for _ in 0..50 {
            if let Some(addr) = handle.listen_addrs().await?.into_iter().next() {
                return Ok((handle, addr, task));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(PartyLineError::StartupFatal {
            reason: "no listen address".into(),
        })
    }

    #[tokio::test]
    async fn gated_host_never_dials_private_address() -> BResult<()> {
        let gated = NetworkConfig {
            block_local_dials: true,
            ..local_only()
        };
        let (a, _, a_task) = listening_host(gated).await?;
        let (b, b_addr, b_task) = listening_host(local_only()).await?;

        let result = a.dial(b.local_peer_id(), vec![b_addr]).await;
        assert!(matches!(result, Err(PartyLineError::PeerUnreachable { .. })));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a.connected_peers().await?.is_empty());
        assert!(b.connected_peers().await?.is_empty());

        a_task.abort();
        b_task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn ungated_host_dials_local_address() -> BResult<()> {
        let (a, _, a_task) = listening_host(local_only()).await?;
        let (b, b_addr, b_task) = listening_host(local_only()).await?;

        let dialed = tokio::time::timeout(
            Duration::from_secs(10),
            a.dial(b.local_peer_id(), vec![b_addr]),
        )
        .await;
        assert!(matches!(dialed, Ok(Ok(()))));
        assert!(a.connected_peers().await?.contains(&b.local_peer_id()));

        // Already connected: returns without a new dial.
        a.dial(b.local_peer_id(), Vec::new()).await?;

        a_task.abort();
        b_task.abort();
        Ok(())
    }
}

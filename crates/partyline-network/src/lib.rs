//! Party Line network layer.
//!
//! Brings a node onto the libp2p network, runs the chat handshake with
//! every peer and moves messages between the wire and the event hub.
//!
//! # Architecture
//!
//! - [`config`]: network configuration with defaults
//! - [`identity`]: keypairs and peer ids
//! - [`transport`] / [`host`]: TCP + QUIC + relay transports and the
//!   task that drives the swarm
//! - [`discovery`], [`relay`], [`nat`], [`hole_punch`]: DHT bootstrap,
//!   relay reservations, NAT diagnostics and DCUtR
//! - [`gate`]: optional block on outbound dials to local addresses
//! - [`protocol`]: length-prefixed CBOR records on the chat stream
//! - [`session`]: handshake plus the reader/writer pair of one peer
//! - [`registry`] / [`fanout`]: per-peer outbound queues and the router
//!   that fills them
//! - [`manager`]: startup sequence and `connect_to_peer`

pub mod config;
pub mod discovery;
pub mod fanout;
pub mod gate;
pub mod hole_punch;
pub mod host;
pub mod identity;
pub mod manager;
pub mod nat;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;

pub use config::NetworkConfig;
pub use manager::{parse_dial_target, DialTarget, PeerManager};
pub use session::{Direction, Session, SessionContext};

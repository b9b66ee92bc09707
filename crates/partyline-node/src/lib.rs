//! Party Line node runtime.
//!
//! Wires the event hub, the recording store and the peer network into
//! one running participant, and turns connect requests from the hub
//! into dials.

pub mod config;
pub mod connect;
pub mod node;

pub use config::NodeConfig;
pub use node::{Node, NodeState};

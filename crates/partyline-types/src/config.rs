//! Event hub configuration with sensible defaults.
//!
//! Queue bounds and the listener backpressure policy are explicit
//! configuration rather than implicit channel constants.

use serde::{Deserialize, Serialize};

use crate::{PartyLineError, Result};

/// What the hub worker does when a listener queue is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Wait for the listener to make room. A stalled listener stalls the
    /// whole hub until it drains or is unregistered.
    #[default]
    Block,
    /// Skip the full listener for this event and keep going. The event is
    /// lost for that listener only.
    DropNewest,
}

/// Configuration of the in-process event hub.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Bound of the queue of locally authored messages.
    pub outgoing_queue_capacity: usize,

    /// Bound of the queue of messages received from the network.
    pub incoming_queue_capacity: usize,

    /// Bound of the queue between the hub worker and the fan-out router.
    pub publish_queue_capacity: usize,

    /// Bound of every listener's event queue.
    pub listener_queue_capacity: usize,

    /// Behaviour when a listener queue is full.
    pub broadcast_policy: BroadcastPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outgoing_queue_capacity: 1024,
            incoming_queue_capacity: 1024,
            publish_queue_capacity: 1024,
            listener_queue_capacity: 1024,
            broadcast_policy: BroadcastPolicy::Block,
        }
    }
}

impl HubConfig {
    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any queue capacity is zero.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("outgoing_queue_capacity", self.outgoing_queue_capacity),
            ("incoming_queue_capacity", self.incoming_queue_capacity),
            ("publish_queue_capacity", self.publish_queue_capacity),
            ("listener_queue_capacity", self.listener_queue_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(PartyLineError::ConfigError {
                    reason: format!("{name} must be greater than 0"),
                });
            }
        }
        Ok(())
    }
}

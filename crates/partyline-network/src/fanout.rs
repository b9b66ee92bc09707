//! Fan-out router: the single consumer of the hub's publish queue.
//!
//! For each locally authored message the router fills in attachment
//! payloads from the recording store, then pushes one shared copy onto
//! every outbound queue registered at that moment. A full queue is
//! awaited, never skipped: a slow peer applies backpressure to the
//! router rather than losing messages. Peers that connect later do not
//! receive earlier messages.

use std::sync::Arc;

use partyline_hub::PublishQueue;
use partyline_storage::RecordingStore;
use partyline_types::{AttachmentKind, Message, PartyLineError};

use crate::registry::PeerRegistry;

/// Broadcasts outgoing messages to every connected peer.
pub struct FanoutRouter {
    registry: Arc<PeerRegistry>,
    store: Arc<dyn RecordingStore>,
}

impl FanoutRouter {
    /// Creates a router over `registry`, resolving attachments in `store`.
    pub fn new(registry: Arc<PeerRegistry>, store: Arc<dyn RecordingStore>) -> Self {
        Self { registry, store }
    }

    /// Consumes `publish` until the hub closes it.
    pub async fn run(self, mut publish: PublishQueue) {
        tracing::info!("fan-out router started");
        while let Some(msg) = publish.recv().await {
            self.broadcast(msg).await;
        }
        tracing::info!("fan-out router stopped");
    }

    /// Hydrates `msg` and queues it for every registered peer.
    ///
    /// Returns the number of peers it was queued for.
    pub async fn broadcast(&self, mut msg: Message) -> usize {
        self.hydrate(&mut msg);
        let msg = Arc::new(msg);

        let mut queued = 0usize;
        for (peer, tx) in self.registry.snapshot() {
            match tx.send(Arc::clone(&msg)).await {
                Ok(()) => queued += 1,
                Err(_) => tracing::debug!(%peer, "peer disconnected during fan-out"),
            }
        }
        tracing::debug!(peers = queued, "message fanned out");
        queued
    }

    /// Fills in every empty audio attachment payload from the store.
    ///
    /// Missing or unreadable recordings are logged and left empty: the
    /// message is still delivered. Returns how many attachments stayed
    /// unresolved.
    pub fn hydrate(&self, msg: &mut Message) -> usize {
        let mut unresolved = 0usize;

        for attachment in msg.attachments.iter_mut() {
            if attachment.is_resolved() {
                continue;
            }
            if attachment.kind != AttachmentKind::AudioOpus {
                tracing::debug!(id = %attachment.id, kind = %attachment.kind, "no resolver for attachment kind");
                unresolved += 1;
                continue;
            }

            let payload = match self.store.get_recording(&attachment.id) {
                Ok(Some(recording)) => recording.to_payload(),
                Ok(None) => Err(PartyLineError::AttachmentUnresolved {
                    id: attachment.id.clone(),
                }),
                Err(e) => Err(e),
            };
            match payload {
                Ok(bytes) => attachment.payload = bytes,
                Err(error) => {
                    tracing::warn!(id = %attachment.id, %error, "attachment left empty");
                    unresolved += 1;
                }
            }
        }
        unresolved
    }
}

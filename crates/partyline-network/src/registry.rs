//! Registry of per-peer outbound queues.
//!
//! Every live session owns exactly one [`OutboundQueue`]. The fan-out
//! router is the only producer, the session's writer the only consumer.
//! Registration hands out a ticket; removal must present it, so a stale
//! session tearing down after its peer reconnected cannot remove the
//! fresh queue.
//!
//! # Locking
//!
//! A `std::sync::Mutex` guards the map for insert, remove and snapshot
//! only. Queue sends happen on snapshot handles with the lock released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libp2p::PeerId;
use partyline_types::Message;
use tokio::sync::mpsc;

/// Producer handle of one peer's queue.
pub type OutboundSender = mpsc::Sender<Arc<Message>>;

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

/// Consumer side of one peer's queue, handed to its session writer.
#[derive(Debug)]
pub struct OutboundQueue {
    peer: PeerId,
    ticket: u64,
    rx: mpsc::Receiver<Arc<Message>>,
}

impl OutboundQueue {
    /// Peer this queue delivers to.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Registration ticket, needed for [`PeerRegistry::remove`].
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Next queued message, or `None` once the registry dropped the
    /// producer side.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// PeerRegistry
// ---------------------------------------------------------------------------

struct Entry {
    ticket: u64,
    tx: OutboundSender,
}

/// Thread-safe map from connected peer to its outbound queue.
pub struct PeerRegistry {
    entries: Mutex<HashMap<PeerId, Entry>>,
    next_ticket: AtomicU64,
    capacity: usize,
}

impl PeerRegistry {
    /// Creates an empty registry whose queues hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Creates a fresh queue for `peer`.
    ///
    /// An existing queue for the same peer is replaced; its consumer sees
    /// the queue close once drained.
    pub fn register(&self, peer: PeerId) -> OutboundQueue {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let replaced = self.lock().insert(peer, Entry { ticket, tx }).is_some();
        if replaced {
            tracing::info!(%peer, ticket, "peer reconnected; previous outbound queue replaced");
        } else {
            tracing::debug!(%peer, ticket, "outbound queue registered");
        }
        OutboundQueue { peer, ticket, rx }
    }

    /// Removes `peer`'s queue if it is still the one issued with `ticket`.
    /// Returns whether anything was removed.
    pub fn remove(&self, peer: &PeerId, ticket: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(peer) {
            Some(entry) if entry.ticket == ticket => {
                entries.remove(peer);
                tracing::debug!(%peer, ticket, "outbound queue removed");
                true
            }
            _ => false,
        }
    }

    /// Producer handles of every registered queue.
    pub fn snapshot(&self) -> Vec<(PeerId, OutboundSender)> {
        self.lock()
            .iter()
            .map(|(peer, entry)| (*peer, entry.tx.clone()))
            .collect()
    }

    /// Returns whether `peer` has a queue.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.lock().contains_key(peer)
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().keys().copied().collect()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether no queue is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Entry>> {
        // Entries hold only channel handles, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use partyline_types::UserInfo;

    use super::*;

    fn msg(text: &str) -> Arc<Message> {
        Arc::new(Message::text(UserInfo::new("a", "a"), text))
    }

    #[tokio::test]
    async fn register_and_deliver() {
        let registry = PeerRegistry::new(4);
        let peer = PeerId::random();
        let mut queue = registry.register(peer);
        assert_eq!(queue.peer(), peer);

        for (_, tx) in registry.snapshot() {
            assert!(tx.send(msg("x")).await.is_ok());
        }
        assert_eq!(queue.recv().await.and_then(|m| m.text.clone()), Some("x".into()));
    }

    #[tokio::test]
    async fn remove_closes_queue() {
        let registry = PeerRegistry::new(4);
        let peer = PeerId::random();
        let mut queue = registry.register(peer);

        assert!(registry.remove(&peer, queue.ticket()));
        assert!(registry.is_empty());
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn stale_ticket_cannot_remove_new_queue() {
        let registry = PeerRegistry::new(4);
        let peer = PeerId::random();
        let mut old = registry.register(peer);
        let new = registry.register(peer);
        assert_ne!(old.ticket(), new.ticket());

        // The replaced queue closes.
        assert!(old.recv().await.is_none());
        // Its teardown must not evict the reconnected session.
        assert!(!registry.remove(&peer, old.ticket()));
        assert!(registry.contains(&peer));
        assert!(registry.remove(&peer, new.ticket()));
    }

    #[test]
    fn peers_lists_registered() {
        let registry = PeerRegistry::new(4);
        let a = PeerId::random();
        let b = PeerId::random();
        let _qa = registry.register(a);
        let _qb = registry.register(b);
        let mut peers = registry.peers();
        peers.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(peers, expected);
        assert_eq!(registry.len(), 2);
    }
}

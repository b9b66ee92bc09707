//! Registry of named listener queues.
//!
//! Each registration is an id plus the sending half of a bounded event
//! queue. The consumer owns the receiving half. The registry only keeps
//! the association and never closes or drains a consumer's queue beyond
//! dropping its own sender.
//!
//! # Locking
//!
//! The map is guarded by a `std::sync::Mutex` held only for insert,
//! remove and snapshot. Broadcasts send on the snapshot with the lock
//! released, so a full queue never blocks registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use partyline_types::config::BroadcastPolicy;
use partyline_types::Event;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// ListenerSlot
// ---------------------------------------------------------------------------

/// One registered listener as seen by a broadcast.
#[derive(Clone)]
struct ListenerSlot {
    id: String,
    tx: mpsc::Sender<Event>,
    /// Set once the slot leaves the registry. Stays set, so every
    /// broadcast stuck on a full queue observes it and gives up.
    removed: Arc<watch::Sender<bool>>,
}

impl ListenerSlot {
    fn mark_removed(&self) {
        self.removed.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// ListenerRegistry
// ---------------------------------------------------------------------------

/// Thread-safe map from listener id to event queue.
pub struct ListenerRegistry {
    slots: Mutex<HashMap<String, ListenerSlot>>,
    capacity: usize,
}

impl ListenerRegistry {
    /// Creates an empty registry whose queues hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers `id` and returns the read side of its new queue.
    ///
    /// A duplicate id silently replaces the previous registration. The
    /// replaced consumer sees end-of-stream once it has drained what was
    /// already delivered.
    pub fn register(&self, id: impl Into<String>) -> mpsc::Receiver<Event> {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        let slot = ListenerSlot {
            id: id.clone(),
            tx,
            removed: Arc::new(watch::Sender::new(false)),
        };
        let previous = self.lock().insert(id.clone(), slot);
        if let Some(previous) = previous {
            previous.mark_removed();
            tracing::debug!(listener = %id, "listener registration replaced");
        } else {
            tracing::debug!(listener = %id, "listener registered");
        }
        rx
    }

    /// Removes `id`. Returns whether it was registered.
    ///
    /// Events already sitting in the queue stay readable.
    pub fn unregister(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(slot) => {
                slot.mark_removed();
                tracing::debug!(listener = %id, "listener unregistered");
                true
            }
            None => false,
        }
    }

    /// Returns whether `id` is currently registered.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers `event` to every listener registered when the call starts.
    ///
    /// Under [`BroadcastPolicy::Block`] a full queue is awaited until it
    /// has room or its listener is unregistered. Under
    /// [`BroadcastPolicy::DropNewest`] the event is skipped for that
    /// listener. Listeners whose consumer dropped the queue are pruned.
    ///
    /// Returns the number of listeners that received the event.
    pub async fn broadcast(&self, event: &Event, policy: BroadcastPolicy) -> usize {
        let targets = self.snapshot();
        let mut delivered = 0usize;
        let mut closed = Vec::new();

        for target in targets {
            match policy {
                BroadcastPolicy::Block => {
                    let mut removed = target.removed.subscribe();
                    tokio::select! {
                        biased;
                        _ = removed.wait_for(|gone| *gone) => {
                            tracing::debug!(
                                listener = %target.id,
                                "listener removed while blocked; event abandoned"
                            );
                        }
                        sent = target.tx.send(event.clone()) => match sent {
                            Ok(()) => delivered += 1,
                            Err(_) => closed.push(target),
                        },
                    }
                }
                BroadcastPolicy::DropNewest => match target.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            listener = %target.id,
                            event = event.kind.label(),
                            "listener queue full; event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(target),
                },
            }
        }

        for slot in closed {
            self.prune(&slot);
        }
        delivered
    }

    // -- Internal ---------------------------------------------------------

    fn snapshot(&self) -> Vec<ListenerSlot> {
        self.lock().values().cloned().collect()
    }

    /// Removes `slot` unless its id has since been re-registered.
    fn prune(&self, slot: &ListenerSlot) {
        let mut slots = self.lock();
        let same = slots
            .get(&slot.id)
            .is_some_and(|current| current.tx.same_channel(&slot.tx));
        if same {
            slots.remove(&slot.id);
            tracing::debug!(listener = %slot.id, "pruned listener with dropped queue");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ListenerSlot>> {
        // Slots hold only channel handles, so a poisoned map is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

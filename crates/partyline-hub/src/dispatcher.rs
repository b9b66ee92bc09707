//! The dispatcher handle and its serializing worker.
//!
//! [`Dispatcher::new`] returns three pieces:
//!
//! - the cloneable [`Dispatcher`] handle used by the API layer and the
//!   peer network,
//! - the [`DispatcherWorker`], which the caller spawns as a tokio task,
//! - the [`PublishQueue`] through which locally authored messages leave
//!   the hub for the fan-out router.
//!
//! The worker services `outgoing` and `incoming` with no fixed priority
//! between them. Each queue is strictly FIFO. Every dequeued message
//! produces exactly one event, broadcast to the listeners registered at
//! that moment.

use std::sync::Arc;

use partyline_types::config::{BroadcastPolicy, HubConfig};
use partyline_types::{Event, EventKind, Message, PartyLineError, Result, UserInfo};
use tokio::sync::{mpsc, watch};

use crate::listeners::ListenerRegistry;

/// Read side of the queue of locally authored messages awaiting fan-out.
pub type PublishQueue = mpsc::Receiver<Message>;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Inner {
    outgoing_tx: mpsc::Sender<Message>,
    incoming_tx: mpsc::Sender<Message>,
    listeners: Arc<ListenerRegistry>,
    policy: BroadcastPolicy,
    shutdown_tx: watch::Sender<bool>,
}

/// Cloneable handle to the event hub.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates the hub.
    ///
    /// The returned worker does nothing until it is spawned. Until then
    /// `submit_*` calls queue up to the configured capacity and then
    /// wait.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` is invalid.
    pub fn new(config: &HubConfig) -> Result<(Self, DispatcherWorker, PublishQueue)> {
        config.validate()?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_queue_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_queue_capacity);
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listeners = Arc::new(ListenerRegistry::new(config.listener_queue_capacity));

        let dispatcher = Self {
            inner: Arc::new(Inner {
                outgoing_tx,
                incoming_tx,
                listeners: Arc::clone(&listeners),
                policy: config.broadcast_policy,
                shutdown_tx,
            }),
        };
        let worker = DispatcherWorker {
            outgoing_rx,
            incoming_rx,
            publish_tx,
            listeners,
            policy: config.broadcast_policy,
            shutdown_rx,
        };
        Ok((dispatcher, worker, publish_rx))
    }

    /// Queues a locally authored message for broadcast.
    ///
    /// Waits only while the outgoing queue is at capacity.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` if the message has no author id.
    /// - `HubClosed` if the worker has stopped.
    pub async fn submit_outgoing(&self, msg: Message) -> Result<()> {
        check_author(&msg)?;
        self.inner
            .outgoing_tx
            .send(msg)
            .await
            .map_err(|_| PartyLineError::HubClosed {
                reason: "outgoing queue closed".into(),
            })
    }

    /// Queues a message received from the network.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` if the message has no author id.
    /// - `HubClosed` if the worker has stopped.
    pub async fn submit_incoming(&self, msg: Message) -> Result<()> {
        check_author(&msg)?;
        self.inner
            .incoming_tx
            .send(msg)
            .await
            .map_err(|_| PartyLineError::HubClosed {
                reason: "incoming queue closed".into(),
            })
    }

    /// Broadcasts `PeerJoined` right away, bypassing the message queues.
    pub async fn notify_peer_joined(&self, peer: UserInfo) {
        self.broadcast_now(EventKind::PeerJoined(peer)).await;
    }

    /// Broadcasts `ConnectToPeerRequested` right away, bypassing the
    /// message queues.
    pub async fn notify_connect_requested(&self, target: impl Into<String>) {
        self.broadcast_now(EventKind::ConnectToPeerRequested(target.into()))
            .await;
    }

    /// Registers a listener and returns its event queue.
    ///
    /// Re-using an id replaces the earlier registration.
    pub fn register_listener(&self, id: impl Into<String>) -> mpsc::Receiver<Event> {
        self.inner.listeners.register(id)
    }

    /// Stops delivering events to `id`. Returns whether it was registered.
    pub fn unregister_listener(&self, id: &str) -> bool {
        self.inner.listeners.unregister(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Asks the worker to stop after the message it is handling.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    async fn broadcast_now(&self, kind: EventKind) {
        let event = Event::new(kind);
        let delivered = self.inner.listeners.broadcast(&event, self.inner.policy).await;
        tracing::debug!(event = event.kind.label(), delivered, "event broadcast");
    }
}

fn check_author(msg: &Message) -> Result<()> {
    if msg.author.peer_id.is_empty() {
        return Err(PartyLineError::ProtocolViolation {
            reason: "message author has no peer id".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DispatcherWorker
// ---------------------------------------------------------------------------

/// The hub's single serializing worker.
pub struct DispatcherWorker {
    outgoing_rx: mpsc::Receiver<Message>,
    incoming_rx: mpsc::Receiver<Message>,
    publish_tx: mpsc::Sender<Message>,
    listeners: Arc<ListenerRegistry>,
    policy: BroadcastPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl DispatcherWorker {
    /// Runs until [`Dispatcher::shutdown`] is called or every
    /// [`Dispatcher`] handle is dropped.
    pub async fn run(mut self) {
        tracing::info!("event hub worker started");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(msg) = self.outgoing_rx.recv() => self.handle_outgoing(msg).await,
                Some(msg) = self.incoming_rx.recv() => self.handle_incoming(msg).await,
                else => break,
            }
        }

        tracing::info!("event hub worker stopped");
    }

    /// Emits `MessageSent` so local listeners see their own message, then
    /// hands the message to the fan-out router.
    async fn handle_outgoing(&mut self, msg: Message) {
        let event = Event::new(EventKind::MessageSent(msg.clone()));
        self.listeners.broadcast(&event, self.policy).await;

        if self.publish_tx.send(msg).await.is_err() {
            tracing::debug!("no fan-out router attached; message stays local");
        }
    }

    async fn handle_incoming(&mut self, msg: Message) {
        let author = msg.author.peer_id.clone();
        let event = Event::new(EventKind::MessageReceived(msg));
        let delivered = self.listeners.broadcast(&event, self.policy).await;
        tracing::debug!(%author, delivered, "incoming message dispatched");
    }
}

//! In-process event hub for Party Line.
//!
//! The [`Dispatcher`] decouples message producers and consumers from the
//! network and UI layers. It owns two FIFO work queues (locally authored
//! messages and messages received from the network), a registry of named
//! listener queues, and a single serializing [`DispatcherWorker`] that
//! turns queued messages into [`Event`](partyline_types::Event)s.
//!
//! The hub knows nothing about sockets or storage. Locally authored
//! messages leave the hub through the publish queue returned by
//! [`Dispatcher::new`], which the network's fan-out router consumes.

pub mod dispatcher;
pub mod listeners;

pub use dispatcher::{Dispatcher, DispatcherWorker, PublishQueue};
pub use listeners::ListenerRegistry;

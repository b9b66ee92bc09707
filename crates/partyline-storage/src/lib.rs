//! Audio recording store for Party Line.
//!
//! The peer network consumes this store through the [`RecordingStore`]
//! trait: the fan-out router looks recordings up to hydrate outgoing
//! attachments, and the stream reader persists recordings that arrive
//! attached to inbound messages. Capture and playback sit outside the
//! core and only need [`MemoryRecordingStore::new_local_recording`] and
//! [`RecordingStore::add_recording`].

pub mod recordings;

pub use recordings::{MemoryRecordingStore, RecordingStore};

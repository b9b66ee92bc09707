//! Recording store trait and the in-memory implementation.
//!
//! # Thread Safety
//!
//! `MemoryRecordingStore` guards its map with `std::sync::RwLock`. Locks
//! are never held across an `.await`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use partyline_types::audio::Recording;
use partyline_types::{PartyLineError, Result};

// ---------------------------------------------------------------------------
// RecordingStore
// ---------------------------------------------------------------------------

/// Lookup and persistence of audio recordings by id.
pub trait RecordingStore: Send + Sync {
    /// Returns the recording stored under `id`, or `Ok(None)` if unknown.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backing store is unusable.
    fn get_recording(&self, id: &str) -> Result<Option<Recording>>;

    /// Stores `recording` under its own id, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backing store is unusable.
    fn add_recording(&self, recording: Recording) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryRecordingStore
// ---------------------------------------------------------------------------

/// Process-local recording store.
#[derive(Debug, Default)]
pub struct MemoryRecordingStore {
    recordings: RwLock<HashMap<String, Recording>>,
}

impl MemoryRecordingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh, empty recording under a random UUID and stores
    /// it. The capture side fills in frames and calls
    /// [`RecordingStore::add_recording`] when done.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store lock is poisoned.
    pub fn new_local_recording(&self) -> Result<Recording> {
        let id = uuid::Uuid::new_v4().to_string();
        let recording = Recording::new(id.clone(), Vec::new());
        self.write()?.insert(id.clone(), recording.clone());
        tracing::debug!(recording_id = %id, "new local recording");
        Ok(recording)
    }

    /// Number of stored recordings.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Returns whether the store holds no recordings.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    // -- Internal ---------------------------------------------------------

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Recording>>> {
        self.recordings.read().map_err(|e| PartyLineError::StorageError {
            reason: format!("recording store lock poisoned: {e}"),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Recording>>> {
        self.recordings.write().map_err(|e| PartyLineError::StorageError {
            reason: format!("recording store lock poisoned: {e}"),
        })
    }
}

impl RecordingStore for MemoryRecordingStore {
    fn get_recording(&self, id: &str) -> Result<Option<Recording>> {
        Ok(self.read()?.get(id).cloned())
    }

    fn add_recording(&self, recording: Recording) -> Result<()> {
        let id = recording.id.clone();
        let frames = recording.frames.len();
        self.write()?.insert(id.clone(), recording);
        tracing::debug!(recording_id = %id, frames, "recording stored");
        Ok(())
    }
}

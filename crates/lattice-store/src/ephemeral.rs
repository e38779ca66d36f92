//! In-memory checkpoint backend. Lost on process restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::{CheckpointEntry, StoreError};

pub(crate) struct Ephemeral {
    entries: Mutex<HashMap<Uuid, CheckpointEntry>>,
}

impl Ephemeral {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, CheckpointEntry>> {
        // Nothing panics while the lock is held; recover from poisoning.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn put(&self, handle: Uuid, snapshot: &[u8]) {
        self.entries()
            .insert(handle, CheckpointEntry::now(snapshot.to_vec()));
    }

    pub(crate) fn entry(&self, handle: Uuid) -> Option<CheckpointEntry> {
        self.entries().get(&handle).cloned()
    }

    pub(crate) fn delete(&self, handle: Uuid) -> Result<(), StoreError> {
        self.entries()
            .remove(&handle)
            .map(|_| ())
            .ok_or(StoreError::NotFound(handle))
    }

    pub(crate) fn handles(&self) -> Vec<Uuid> {
        self.entries().keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

//! Checkpoint persistence for in-flight tasks.
//!
//! Stores the most recent snapshot per task handle. Two backends:
//! ephemeral (in-memory, lost on restart) and durable (a directory of
//! per-handle files plus an fsync'd sidecar index, reloaded before the
//! node accepts work).

pub mod config;

mod durable;
mod ephemeral;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{CheckpointConfig, CheckpointMode};
use crate::durable::Durable;
use crate::ephemeral::Ephemeral;

/// Errors surfaced by checkpoint operations.
///
/// I/O failures never fail the owning task; callers log them and proceed
/// without a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot for {handle} is {size} bytes, over the {max}-byte bound")]
    SnapshotTooLarge {
        handle: Uuid,
        size: usize,
        max: usize,
    },

    #[error("no checkpoint for {0}")]
    NotFound(Uuid),

    #[error("checkpoint i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint record: {0}")]
    Corrupt(String),

    #[error("invalid checkpoint config: {0}")]
    Config(String),
}

/// A snapshot with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub timestamp: DateTime<Utc>,
    pub snapshot: Vec<u8>,
}

impl CheckpointEntry {
    pub(crate) fn now(snapshot: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            snapshot,
        }
    }
}

enum Backend {
    Ephemeral(Ephemeral),
    Durable(Durable),
}

/// The checkpoint store: most recent snapshot per task handle.
///
/// All methods are synchronous and cheap; durable writes are batched in
/// memory and flushed by write count, by the periodic flusher, or by an
/// explicit [`CheckpointStore::flush`].
pub struct CheckpointStore {
    backend: Backend,
    max_snapshot_bytes: usize,
}

impl CheckpointStore {
    /// Open a store for the given config.
    ///
    /// Durable mode reads the sidecar index and reloads every entry
    /// before returning, so the caller sees pre-restart snapshots.
    pub fn open(config: &CheckpointConfig) -> Result<Self, StoreError> {
        let backend = match config.mode {
            CheckpointMode::Ephemeral => Backend::Ephemeral(Ephemeral::new()),
            CheckpointMode::Durable => {
                let path = config.durable_path.as_ref().ok_or_else(|| {
                    StoreError::Config(
                        "checkpoint.durable_path is required when checkpoint.mode = durable"
                            .to_string(),
                    )
                })?;
                Backend::Durable(Durable::open(
                    path,
                    config.flush_every_writes,
                )?)
            }
        };

        Ok(Self {
            backend,
            max_snapshot_bytes: config.max_snapshot_bytes,
        })
    }

    /// Write-through put: overwrites any previous snapshot for the handle.
    pub fn put(&self, handle: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        if snapshot.len() > self.max_snapshot_bytes {
            return Err(StoreError::SnapshotTooLarge {
                handle,
                size: snapshot.len(),
                max: self.max_snapshot_bytes,
            });
        }

        match &self.backend {
            Backend::Ephemeral(e) => {
                e.put(handle, snapshot);
                Ok(())
            }
            Backend::Durable(d) => d.put(handle, snapshot),
        }
    }

    /// Read the most recent snapshot bytes for a handle.
    pub fn get(&self, handle: Uuid) -> Option<Vec<u8>> {
        self.entry(handle).map(|e| e.snapshot)
    }

    /// Read the full entry (snapshot plus timestamp) for a handle.
    pub fn entry(&self, handle: Uuid) -> Option<CheckpointEntry> {
        match &self.backend {
            Backend::Ephemeral(e) => e.entry(handle),
            Backend::Durable(d) => d.entry(handle),
        }
    }

    /// Remove the snapshot for a handle.
    pub fn delete(&self, handle: Uuid) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Ephemeral(e) => e.delete(handle),
            Backend::Durable(d) => d.delete(handle),
        }
    }

    /// Snapshot of all handles with a stored checkpoint.
    pub fn handles(&self) -> Vec<Uuid> {
        match &self.backend {
            Backend::Ephemeral(e) => e.handles(),
            Backend::Durable(d) => d.handles(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Ephemeral(e) => e.len(),
            Backend::Durable(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force pending durable writes to disk. No-op for ephemeral mode.
    pub fn flush(&self) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Ephemeral(_) => Ok(()),
            Backend::Durable(d) => d.flush(),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Durable(_))
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        if let Backend::Durable(d) = &self.backend {
            if let Err(e) = d.flush() {
                tracing::warn!(error = %e, "final checkpoint flush failed");
            }
        }
    }
}

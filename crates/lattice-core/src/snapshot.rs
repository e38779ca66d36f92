//! The envelope the core stores per task in the checkpoint store.
//!
//! Snapshots carry enough to re-place a task after a restart (function,
//! input, attempt budget) alongside whatever progress the worker last
//! saved. Store failures never fail the owning task; writers log and
//! continue without a checkpoint.

use serde::{Deserialize, Serialize};

use lattice_store::{CheckpointStore, StoreError};

use crate::task::TaskHandle;

/// Per-task state persisted between attempts and across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub fn_id: String,
    pub input: Vec<u8>,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Opaque progress bytes saved by the worker, if any.
    pub progress: Option<Vec<u8>>,
}

impl TaskSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Best-effort envelope write.
pub(crate) fn write_envelope(store: &CheckpointStore, handle: TaskHandle, snapshot: &TaskSnapshot) {
    let bytes = match snapshot.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(handle = %handle, error = %e, "failed to encode task snapshot");
            return;
        }
    };
    if let Err(e) = store.put(handle.as_uuid(), &bytes) {
        tracing::warn!(
            handle = %handle,
            error = %e,
            "checkpoint write failed, task continues without one"
        );
    }
}

/// Read and decode the envelope for a handle, logging anything unreadable.
pub(crate) fn read_envelope(store: &CheckpointStore, handle: TaskHandle) -> Option<TaskSnapshot> {
    let bytes = store.get(handle.as_uuid())?;
    match TaskSnapshot::decode(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(handle = %handle, error = %e, "unreadable task snapshot");
            None
        }
    }
}

/// Merge worker progress into the stored envelope.
///
/// Called on the owning node (locally or via the transport) so the store
/// keeps a single writer per handle.
pub(crate) fn record_progress(
    store: &CheckpointStore,
    handle: TaskHandle,
    progress: &[u8],
) -> Result<(), StoreError> {
    let mut snapshot =
        read_envelope(store, handle).ok_or(StoreError::NotFound(handle.as_uuid()))?;
    snapshot.progress = Some(progress.to_vec());
    let bytes = snapshot
        .encode()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    store.put(handle.as_uuid(), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_store::config::CheckpointConfig;

    fn store() -> CheckpointStore {
        CheckpointStore::open(&CheckpointConfig::default()).expect("ephemeral open")
    }

    fn snapshot() -> TaskSnapshot {
        TaskSnapshot {
            fn_id: "double".into(),
            input: b"7".to_vec(),
            attempt: 1,
            max_attempts: 3,
            progress: None,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let original = TaskSnapshot {
            progress: Some(b"state-42".to_vec()),
            ..snapshot()
        };
        let decoded = TaskSnapshot::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn progress_merges_into_envelope() {
        let store = store();
        let handle = TaskHandle::mint();

        write_envelope(&store, handle, &snapshot());
        record_progress(&store, handle, b"state-42").unwrap();

        let merged = read_envelope(&store, handle).unwrap();
        assert_eq!(merged.fn_id, "double");
        assert_eq!(merged.progress, Some(b"state-42".to_vec()));
    }

    #[test]
    fn progress_without_envelope_is_not_found() {
        let store = store();
        let result = record_progress(&store, TaskHandle::mint(), b"x");
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}

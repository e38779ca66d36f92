//! On-disk checkpoint backend.
//!
//! Layout: one `<handle>.ckpt` file per task under the configured
//! directory, each holding `(timestamp, snapshot)` as JSON with the
//! snapshot hex-encoded, plus a sidecar `index.json` mapping handles to
//! file names. The index is fsync'd after each write batch; snapshot
//! files are written to a temp name and renamed into place.
//!
//! Writes accumulate in memory and hit disk when the dirty count reaches
//! the configured threshold, when the periodic flusher runs, or on an
//! explicit flush.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CheckpointEntry, StoreError};

const INDEX_FILE: &str = "index.json";

/// On-disk shape of one snapshot file.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    timestamp: DateTime<Utc>,
    snapshot_hex: String,
}

/// On-disk shape of the sidecar index.
#[derive(Serialize, Deserialize, Default)]
struct Index {
    entries: HashMap<String, String>,
}

struct Inner {
    entries: HashMap<Uuid, CheckpointEntry>,
    dirty: HashSet<Uuid>,
    removed: HashSet<Uuid>,
    writes_since_flush: u32,
}

pub(crate) struct Durable {
    dir: PathBuf,
    flush_every_writes: u32,
    inner: Mutex<Inner>,
}

impl Durable {
    /// Open the directory, creating it if needed, and reload every entry
    /// named by the index.
    pub(crate) fn open(dir: &Path, flush_every_writes: u32) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;

        let mut entries = HashMap::new();
        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            let raw = fs::read_to_string(&index_path)?;
            let index: Index = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("index: {e}")))?;

            for (handle_str, file_name) in &index.entries {
                match load_snapshot(dir, handle_str, file_name) {
                    Ok((handle, entry)) => {
                        entries.insert(handle, entry);
                    }
                    Err(e) => {
                        // A torn write loses one snapshot, not the store.
                        tracing::warn!(
                            handle = %handle_str,
                            error = %e,
                            "skipping unreadable checkpoint file"
                        );
                    }
                }
            }
        }

        tracing::debug!(
            dir = %dir.display(),
            reloaded = entries.len(),
            "opened durable checkpoint store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            flush_every_writes,
            inner: Mutex::new(Inner {
                entries,
                dirty: HashSet::new(),
                removed: HashSet::new(),
                writes_since_flush: 0,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn put(&self, handle: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        let should_flush = {
            let mut inner = self.inner();
            inner
                .entries
                .insert(handle, CheckpointEntry::now(snapshot.to_vec()));
            inner.dirty.insert(handle);
            inner.removed.remove(&handle);
            inner.writes_since_flush += 1;
            inner.writes_since_flush >= self.flush_every_writes
        };

        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn entry(&self, handle: Uuid) -> Option<CheckpointEntry> {
        self.inner().entries.get(&handle).cloned()
    }

    pub(crate) fn delete(&self, handle: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner();
        if inner.entries.remove(&handle).is_none() {
            return Err(StoreError::NotFound(handle));
        }
        inner.dirty.remove(&handle);
        inner.removed.insert(handle);
        Ok(())
    }

    pub(crate) fn handles(&self) -> Vec<Uuid> {
        self.inner().entries.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner().entries.len()
    }

    /// Write all pending puts and deletes, then rewrite and fsync the
    /// sidecar index.
    pub(crate) fn flush(&self) -> Result<(), StoreError> {
        // Collect the batch under the lock; do I/O outside it.
        let (to_write, to_remove, index) = {
            let mut inner = self.inner();
            if inner.dirty.is_empty() && inner.removed.is_empty() {
                return Ok(());
            }

            let to_write: Vec<(Uuid, CheckpointEntry)> = inner
                .dirty
                .iter()
                .filter_map(|h| inner.entries.get(h).map(|e| (*h, e.clone())))
                .collect();
            let to_remove: Vec<Uuid> = inner.removed.iter().copied().collect();

            let index = Index {
                entries: inner
                    .entries
                    .keys()
                    .map(|h| (h.to_string(), snapshot_file_name(*h)))
                    .collect(),
            };

            inner.dirty.clear();
            inner.removed.clear();
            inner.writes_since_flush = 0;
            (to_write, to_remove, index)
        };

        for (handle, entry) in &to_write {
            write_snapshot(&self.dir, *handle, entry)?;
        }
        for handle in &to_remove {
            let path = self.dir.join(snapshot_file_name(*handle));
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        write_index(&self.dir, &index)?;
        Ok(())
    }
}

fn snapshot_file_name(handle: Uuid) -> String {
    format!("{}.ckpt", handle.simple())
}

fn load_snapshot(
    dir: &Path,
    handle_str: &str,
    file_name: &str,
) -> Result<(Uuid, CheckpointEntry), StoreError> {
    let handle = Uuid::parse_str(handle_str)
        .map_err(|e| StoreError::Corrupt(format!("handle {handle_str}: {e}")))?;

    let raw = fs::read_to_string(dir.join(file_name))?;
    let file: SnapshotFile =
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("{file_name}: {e}")))?;
    let snapshot = hex::decode(&file.snapshot_hex)
        .map_err(|e| StoreError::Corrupt(format!("{file_name}: {e}")))?;

    Ok((
        handle,
        CheckpointEntry {
            timestamp: file.timestamp,
            snapshot,
        },
    ))
}

fn write_snapshot(dir: &Path, handle: Uuid, entry: &CheckpointEntry) -> Result<(), StoreError> {
    let file = SnapshotFile {
        timestamp: entry.timestamp,
        snapshot_hex: hex::encode(&entry.snapshot),
    };
    let raw = serde_json::to_string(&file)
        .map_err(|e| StoreError::Corrupt(format!("encode snapshot: {e}")))?;

    let final_path = dir.join(snapshot_file_name(handle));
    let tmp_path = dir.join(format!("{}.tmp", handle.simple()));
    fs::write(&tmp_path, raw)?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

fn write_index(dir: &Path, index: &Index) -> Result<(), StoreError> {
    let raw = serde_json::to_string(index)
        .map_err(|e| StoreError::Corrupt(format!("encode index: {e}")))?;

    let final_path = dir.join(INDEX_FILE);
    let tmp_path = dir.join("index.json.tmp");
    fs::write(&tmp_path, raw)?;

    let file = fs::File::open(&tmp_path)?;
    file.sync_all()?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_threshold_defers_disk_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let durable = Durable::open(tmp.path(), 3).unwrap();
        let handle = Uuid::new_v4();

        durable.put(handle, b"one").unwrap();
        assert!(!tmp.path().join(snapshot_file_name(handle)).exists());

        durable.put(handle, b"two").unwrap();
        durable.put(handle, b"three").unwrap();
        assert!(tmp.path().join(snapshot_file_name(handle)).exists());
    }

    #[test]
    fn explicit_flush_writes_immediately() {
        let tmp = tempfile::TempDir::new().unwrap();
        let durable = Durable::open(tmp.path(), 100).unwrap();
        let handle = Uuid::new_v4();

        durable.put(handle, b"state").unwrap();
        durable.flush().unwrap();

        assert!(tmp.path().join(snapshot_file_name(handle)).exists());
        assert!(tmp.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn reload_after_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let handle = Uuid::new_v4();

        {
            let durable = Durable::open(tmp.path(), 100).unwrap();
            durable.put(handle, b"state-42").unwrap();
            durable.flush().unwrap();
        }

        let reopened = Durable::open(tmp.path(), 100).unwrap();
        let entry = reopened.entry(handle).expect("entry should survive reopen");
        assert_eq!(entry.snapshot, b"state-42");
    }

    #[test]
    fn delete_removes_file_on_flush() {
        let tmp = tempfile::TempDir::new().unwrap();
        let durable = Durable::open(tmp.path(), 100).unwrap();
        let handle = Uuid::new_v4();

        durable.put(handle, b"x").unwrap();
        durable.flush().unwrap();
        durable.delete(handle).unwrap();
        durable.flush().unwrap();

        assert!(!tmp.path().join(snapshot_file_name(handle)).exists());

        let reopened = Durable::open(tmp.path(), 100).unwrap();
        assert_eq!(reopened.len(), 0);
    }

    #[test]
    fn unreadable_file_is_skipped_on_reload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let keep = Uuid::new_v4();
        let corrupt = Uuid::new_v4();

        {
            let durable = Durable::open(tmp.path(), 100).unwrap();
            durable.put(keep, b"good").unwrap();
            durable.put(corrupt, b"bad").unwrap();
            durable.flush().unwrap();
        }

        fs::write(tmp.path().join(snapshot_file_name(corrupt)), "not json").unwrap();

        let reopened = Durable::open(tmp.path(), 100).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.entry(keep).unwrap().snapshot, b"good");
    }
}

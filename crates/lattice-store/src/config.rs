//! Checkpoint store configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Durability mode for the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    Ephemeral,
    Durable,
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ephemeral => "ephemeral",
            Self::Durable => "durable",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointMode {
    type Err = CheckpointModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(Self::Ephemeral),
            "durable" => Ok(Self::Durable),
            other => Err(CheckpointModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointMode`] string.
#[derive(Debug, Clone)]
pub struct CheckpointModeParseError(pub String);

impl fmt::Display for CheckpointModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint mode: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointModeParseError {}

/// Configuration for the checkpoint store (`[checkpoint]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub mode: CheckpointMode,
    /// Directory for durable snapshots. Required when `mode = durable`.
    pub durable_path: Option<PathBuf>,
    /// Per-snapshot size bound; larger puts fail with `SnapshotTooLarge`.
    pub max_snapshot_bytes: usize,
    /// Flush after this many writes since the last flush.
    pub flush_every_writes: u32,
    /// Flush at least this often while writes are pending.
    pub flush_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            mode: CheckpointMode::Ephemeral,
            durable_path: None,
            max_snapshot_bytes: 1024 * 1024,
            flush_every_writes: 8,
            flush_interval_ms: 200,
        }
    }
}

//! Node configuration.
//!
//! One TOML document with a section per component. Every field has a
//! default so a partial file (or none at all) yields a working
//! single-node setup, and every key can be overridden by a
//! `LATTICE_<SECTION>_<KEY>` environment variable
//! (env > file > default).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use lattice_store::config::{CheckpointConfig, CheckpointMode};

use crate::node_id::NodeId;

/// Full configuration for one cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cluster: ClusterConfig,
    pub discovery: DiscoveryConfig,
    pub supervisor: SupervisorConfig,
    pub recovery: RecoveryConfig,
    pub checkpoint: CheckpointConfig,
    pub distributor: DistributorConfig,
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `LATTICE_`-prefixed environment overrides on top of this
    /// config, one variable per key: section and key name upper-cased
    /// and joined with underscores (`LATTICE_CLUSTER_COOKIE`,
    /// `LATTICE_RECOVERY_MAX_ATTEMPTS`, ...). `dist_port_range` reads
    /// as `LO-HI`. Unset variables leave the value untouched.
    pub fn apply_env_overrides(&mut self) -> Result<(), EnvOverrideError> {
        override_from_env(&mut self.cluster.node_id, "LATTICE_CLUSTER_NODE_ID")?;
        override_from_env(&mut self.cluster.cookie, "LATTICE_CLUSTER_COOKIE")?;
        if let Ok(raw) = std::env::var("LATTICE_CLUSTER_DIST_PORT_RANGE") {
            self.cluster.dist_port_range =
                parse_port_range(&raw).map_err(|message| EnvOverrideError {
                    key: "LATTICE_CLUSTER_DIST_PORT_RANGE".to_string(),
                    message,
                })?;
        }

        override_from_env(
            &mut self.discovery.heartbeat_interval_ms,
            "LATTICE_DISCOVERY_HEARTBEAT_INTERVAL_MS",
        )?;
        override_from_env(
            &mut self.discovery.cleanup_interval_ms,
            "LATTICE_DISCOVERY_CLEANUP_INTERVAL_MS",
        )?;

        override_from_env(
            &mut self.supervisor.shutdown_window_ms,
            "LATTICE_SUPERVISOR_SHUTDOWN_WINDOW_MS",
        )?;
        override_from_env(
            &mut self.supervisor.max_restarts,
            "LATTICE_SUPERVISOR_MAX_RESTARTS",
        )?;
        override_from_env(
            &mut self.supervisor.max_seconds,
            "LATTICE_SUPERVISOR_MAX_SECONDS",
        )?;
        override_from_env(
            &mut self.supervisor.high_water_mark,
            "LATTICE_SUPERVISOR_HIGH_WATER_MARK",
        )?;

        override_from_env(
            &mut self.recovery.max_attempts,
            "LATTICE_RECOVERY_MAX_ATTEMPTS",
        )?;
        override_from_env(
            &mut self.recovery.initial_backoff_ms,
            "LATTICE_RECOVERY_INITIAL_BACKOFF_MS",
        )?;
        override_from_env(
            &mut self.recovery.max_backoff_ms,
            "LATTICE_RECOVERY_MAX_BACKOFF_MS",
        )?;

        override_from_env(&mut self.checkpoint.mode, "LATTICE_CHECKPOINT_MODE")?;
        if let Ok(raw) = std::env::var("LATTICE_CHECKPOINT_DURABLE_PATH") {
            self.checkpoint.durable_path = Some(PathBuf::from(raw));
        }
        override_from_env(
            &mut self.checkpoint.max_snapshot_bytes,
            "LATTICE_CHECKPOINT_MAX_SNAPSHOT_BYTES",
        )?;
        override_from_env(
            &mut self.checkpoint.flush_every_writes,
            "LATTICE_CHECKPOINT_FLUSH_EVERY_WRITES",
        )?;
        override_from_env(
            &mut self.checkpoint.flush_interval_ms,
            "LATTICE_CHECKPOINT_FLUSH_INTERVAL_MS",
        )?;

        override_from_env(
            &mut self.distributor.default_task_timeout_ms,
            "LATTICE_DISTRIBUTOR_DEFAULT_TASK_TIMEOUT_MS",
        )?;
        override_from_env(
            &mut self.distributor.selection_policy,
            "LATTICE_DISTRIBUTOR_SELECTION_POLICY",
        )?;

        Ok(())
    }
}

/// Error returned when a `LATTICE_` environment override fails to parse.
#[derive(Debug, thiserror::Error)]
#[error("invalid value in {key}: {message}")]
pub struct EnvOverrideError {
    pub key: String,
    pub message: String,
}

/// Replace `field` with the parsed value of `key`, when set.
fn override_from_env<T>(field: &mut T, key: &str) -> Result<(), EnvOverrideError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return Ok(());
    };
    *field = raw.parse().map_err(|e: T::Err| EnvOverrideError {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

fn parse_port_range(raw: &str) -> Result<(u16, u16), String> {
    let Some((lo, hi)) = raw.split_once('-') else {
        return Err(format!("expected LO-HI, got {raw:?}"));
    };
    let lo = lo.trim().parse::<u16>().map_err(|e| e.to_string())?;
    let hi = hi.trim().parse::<u16>().map_err(|e| e.to_string())?;
    if hi < lo {
        return Err(format!("port range is inverted: {lo}-{hi}"));
    }
    Ok((lo, hi))
}

/// `[cluster]` -- identity and inter-node auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    /// Shared secret keying the transport's request tags.
    pub cookie: String,
    /// Inclusive port range for inter-node listeners (wire transports).
    pub dist_port_range: (u16, u16),
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::default(),
            cookie: "nocookie".to_string(),
            dist_port_range: (9100, 9199),
        }
    }
}

/// `[discovery]` -- membership heartbeats and pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub heartbeat_interval_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// `[supervisor]` -- worker ownership and component restart intensity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Grace given to a cooperatively stopped worker before it is killed.
    pub shutdown_window_ms: u64,
    pub max_restarts: u32,
    pub max_seconds: u64,
    /// Live-worker bound past which new starts are rejected as overload.
    pub high_water_mark: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_window_ms: 5_000,
            max_restarts: 5,
            max_seconds: 10,
            high_water_mark: 1_024,
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_window(&self) -> Duration {
        Duration::from_millis(self.shutdown_window_ms)
    }
}

/// `[recovery]` -- retry policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// `[distributor]` -- caller-facing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    pub default_task_timeout_ms: u64,
    pub selection_policy: SelectionPolicyKind,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_ms: 30_000,
            selection_policy: SelectionPolicyKind::RoundRobin,
        }
    }
}

impl DistributorConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }
}

/// Which placement policy the node uses.
///
/// `custom:<name>` refers to a policy registered at node construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionPolicyKind {
    RoundRobin,
    LocalPreferred,
    Custom(String),
}

impl fmt::Display for SelectionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round_robin"),
            Self::LocalPreferred => f.write_str("local_preferred"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl FromStr for SelectionPolicyKind {
    type Err = SelectionPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "local_preferred" => Ok(Self::LocalPreferred),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(Self::Custom(name.to_owned())),
                _ => Err(SelectionPolicyParseError(other.to_owned())),
            },
        }
    }
}

impl TryFrom<String> for SelectionPolicyKind {
    type Error = SelectionPolicyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SelectionPolicyKind> for String {
    fn from(kind: SelectionPolicyKind) -> Self {
        kind.to_string()
    }
}

/// Error returned when parsing an invalid [`SelectionPolicyKind`] string.
#[derive(Debug, Clone)]
pub struct SelectionPolicyParseError(pub String);

impl fmt::Display for SelectionPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid selection policy: {:?}", self.0)
    }
}

impl std::error::Error for SelectionPolicyParseError {}

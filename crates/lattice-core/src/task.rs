//! Task and worker model types shared across the core components.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::node_id::NodeId;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque reference to a submitted task, minted at submission.
///
/// The sole reference callers use to query status or cancel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one live worker (one attempt of one task).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a task as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Worker lifecycle
// ---------------------------------------------------------------------------

/// How one worker attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The function returned a value.
    Normal(Vec<u8>),
    Abnormal(ExitReason),
}

/// Abnormal exit reasons, preserved through retries so the final failure
/// carries the original cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The function returned an error.
    Error(String),
    /// The function panicked; the panic payload is captured.
    Panic(String),
    /// No such function in the registry; nothing was invoked.
    UnknownFunction(String),
    /// The worker was stopped, cooperatively or by force.
    Cancelled,
    /// The node running the worker left the up set mid-execution.
    NodeDown(NodeId),
    /// The owning supervisor restarted and lost the worker.
    SupervisorRestart,
    /// No candidate node accepted the dispatch.
    Placement(String),
}

impl ExitReason {
    /// Whether the retry policy applies. Cancellation and unknown
    /// functions are final regardless of remaining attempts.
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::UnknownFunction(_) | Self::Cancelled)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(msg) => f.write_str(msg),
            Self::Panic(msg) => write!(f, "panic: {msg}"),
            Self::UnknownFunction(name) => write!(f, "unknown function: {name}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::NodeDown(node) => write!(f, "node_down: {node}"),
            Self::SupervisorRestart => f.write_str("supervisor_restart"),
            Self::Placement(msg) => write!(f, "placement: {msg}"),
        }
    }
}

/// Lifecycle events published by worker supervisors.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub node: NodeId,
    pub worker: WorkerId,
    pub handle: TaskHandle,
    pub attempt: u32,
    pub kind: LifecycleKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum LifecycleKind {
    Started,
    Exited(ExitStatus),
}

/// Request to start one worker attempt on a node.
#[derive(Debug, Clone)]
pub struct StartWorker {
    /// The node whose distributor owns the task (checkpoints flow back
    /// to its store).
    pub owner: NodeId,
    pub handle: TaskHandle,
    pub fn_id: String,
    pub input: Vec<u8>,
    pub attempt: u32,
    /// Progress saved by a previous attempt, if any.
    pub checkpoint: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Submission surface
// ---------------------------------------------------------------------------

/// Options recognized by `submit`.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// When false, execute inline in the submitting caller, bypassing
    /// the supervisor entirely.
    pub distributed: bool,
    /// Caller-side wait bound. `None` uses the distributor default;
    /// `Duration::MAX` waits forever.
    pub timeout: Option<Duration>,
    /// When true, the submit future resolves with the handle at
    /// placement; the terminal outcome arrives on a separate completion
    /// channel addressed by the handle.
    pub return_ref_mode: bool,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    /// Bypass the selection policy. Honored iff the node is up.
    pub target_node: Option<NodeId>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            distributed: true,
            timeout: None,
            return_ref_mode: false,
            max_attempts: None,
            initial_backoff_ms: None,
            max_backoff_ms: None,
            target_node: None,
        }
    }
}

impl SubmitOptions {
    /// Reject option combinations the distributor cannot honor.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.max_attempts == Some(0) {
            return Err(TaskError::InvalidOptions(
                "max_attempts must be at least 1".into(),
            ));
        }
        if let (Some(initial), Some(max)) = (self.initial_backoff_ms, self.max_backoff_ms) {
            if max < initial {
                return Err(TaskError::InvalidOptions(format!(
                    "max_backoff_ms {max} is below initial_backoff_ms {initial}"
                )));
            }
        }
        Ok(())
    }
}

/// What a submission's continuation eventually carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Placement succeeded (ref mode); the terminal outcome follows on
    /// the completion channel.
    Accepted(TaskHandle),
    Completed(Vec<u8>),
    Failed(TaskError),
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Ok,
    NotFound,
    AlreadyTerminal,
}

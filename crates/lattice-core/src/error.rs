//! Error taxonomy for the task execution core.

use crate::node_id::NodeId;

/// Caller-visible task failure reasons.
///
/// This is the single vocabulary in which terminal outcomes reach
/// submitters; every internal failure is folded into one of these before
/// it crosses the distributor boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The function errored or panicked on its final attempt; the
    /// original reason is preserved.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("task cancelled")]
    TaskCancelled,

    /// The caller-side wait bound elapsed. The task itself keeps running
    /// unless explicitly cancelled.
    #[error("task timed out")]
    TaskTimedOut,

    /// No cluster member was up at placement time.
    #[error("no available node")]
    NoAvailableNode,

    /// An explicit target node is not in the up set.
    #[error("no such node: {0}")]
    NoSuchNode(NodeId),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The target supervisor is past its high-water mark.
    #[error("node {0} is overloaded")]
    NodeOverloaded(NodeId),

    #[error("node {0} unreachable")]
    RemoteUnreachable(NodeId),

    #[error("request to {0} timed out")]
    RemoteTimeout(NodeId),
}

impl TaskError {
    /// Whether the recovery monitor may retry a task that failed this way.
    ///
    /// Placement and transport failures are transient; caller errors and
    /// lifecycle-end outcomes are not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableNode
                | Self::NodeOverloaded(_)
                | Self::RemoteUnreachable(_)
                | Self::RemoteTimeout(_)
        )
    }
}

/// Failures raised by the inter-node transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    #[error("request to {0} timed out")]
    Timeout(NodeId),

    /// The request's cookie tag did not verify on the receiving node.
    #[error("request rejected: bad auth tag")]
    Unauthorized,

    /// The remote side executed the request and rejected it.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl TransportError {
    /// Fold a transport failure into the caller-visible taxonomy.
    pub fn into_task_error(self) -> TaskError {
        match self {
            Self::Unreachable(node) => TaskError::RemoteUnreachable(node),
            Self::Timeout(node) => TaskError::RemoteTimeout(node),
            Self::Unauthorized => TaskError::TaskFailed("unauthorized transport request".into()),
            Self::Task(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_errors_are_retryable() {
        assert!(TaskError::NoAvailableNode.retryable());
        assert!(TaskError::NodeOverloaded(NodeId::new("a@h")).retryable());
        assert!(TaskError::RemoteTimeout(NodeId::new("a@h")).retryable());
        assert!(!TaskError::TaskCancelled.retryable());
        assert!(!TaskError::UnknownFunction("f".into()).retryable());
        assert!(!TaskError::TaskTimedOut.retryable());
    }

    #[test]
    fn transport_errors_fold_into_task_errors() {
        let node = NodeId::new("b@h");
        assert_eq!(
            TransportError::Unreachable(node.clone()).into_task_error(),
            TaskError::RemoteUnreachable(node.clone())
        );
        assert_eq!(
            TransportError::Timeout(node.clone()).into_task_error(),
            TaskError::RemoteTimeout(node)
        );
        assert_eq!(
            TransportError::Task(TaskError::NoAvailableNode).into_task_error(),
            TaskError::NoAvailableNode
        );
    }
}

//! Node selection and dispatch placement.
//!
//! The selection policy is pluggable; the placer wraps it with the
//! candidate-fallback loop both the distributor (first attempt) and the
//! recovery monitor (retries) go through.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::SelectionPolicyKind;
use crate::discovery::Discovery;
use crate::error::{TaskError, TransportError};
use crate::node_id::NodeId;
use crate::task::{StartWorker, WorkerId};
use crate::transport::Transport;

/// Chooses a target from the up set.
///
/// `up` arrives sorted lexicographically; `local` is the selecting node.
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &str;
    fn select(&self, up: &[NodeId], local: &NodeId) -> Option<NodeId>;
}

/// Default policy: rotate through the sorted up set, starting from the
/// local node so the first pick stays local when nothing distinguishes
/// the members.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(&self, up: &[NodeId], local: &NodeId) -> Option<NodeId> {
        if up.is_empty() {
            return None;
        }
        let origin = up.iter().position(|n| n == local).unwrap_or(0);
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(up[(origin + offset) % up.len()].clone())
    }
}

/// Keep work on the local node while it is up, falling back to rotation
/// otherwise.
pub struct LocalPreferred {
    fallback: RoundRobin,
}

impl LocalPreferred {
    pub fn new() -> Self {
        Self {
            fallback: RoundRobin::new(),
        }
    }
}

impl Default for LocalPreferred {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for LocalPreferred {
    fn name(&self) -> &str {
        "local_preferred"
    }

    fn select(&self, up: &[NodeId], local: &NodeId) -> Option<NodeId> {
        if up.contains(local) {
            return Some(local.clone());
        }
        self.fallback.select(up, local)
    }
}

/// Resolve a configured policy kind, looking custom names up in the
/// registry supplied at node construction.
pub(crate) fn build_policy(
    kind: &SelectionPolicyKind,
    custom: &HashMap<String, Arc<dyn SelectionPolicy>>,
) -> Result<Arc<dyn SelectionPolicy>, String> {
    match kind {
        SelectionPolicyKind::RoundRobin => Ok(Arc::new(RoundRobin::new())),
        SelectionPolicyKind::LocalPreferred => Ok(Arc::new(LocalPreferred::new())),
        SelectionPolicyKind::Custom(name) => custom
            .get(name)
            .cloned()
            .ok_or_else(|| format!("no selection policy registered under {name:?}")),
    }
}

/// Shared placement engine.
#[derive(Clone)]
pub(crate) struct Placer {
    pub discovery: Discovery,
    pub policy: Arc<dyn SelectionPolicy>,
    pub transport: Arc<dyn Transport>,
    pub local: NodeId,
}

impl Placer {
    /// Start a worker on a chosen node, falling through the remaining
    /// candidates on overload or transport failure.
    ///
    /// An explicit `target` is honored iff it is up and is never
    /// substituted; without one, the policy picks first and the rest of
    /// the up set backs it up in order.
    pub async fn place(
        &self,
        req: StartWorker,
        target: Option<&NodeId>,
    ) -> Result<(NodeId, WorkerId), TaskError> {
        let up = self.discovery.list_up().await;

        let candidates: Vec<NodeId> = match target {
            Some(node) => {
                if !up.contains(node) {
                    return Err(TaskError::NoSuchNode(node.clone()));
                }
                vec![node.clone()]
            }
            None => {
                if up.is_empty() {
                    return Err(TaskError::NoAvailableNode);
                }
                let first = self
                    .policy
                    .select(&up, &self.local)
                    .ok_or(TaskError::NoAvailableNode)?;
                let mut rest: Vec<NodeId> =
                    up.into_iter().filter(|n| *n != first).collect();
                let mut candidates = vec![first];
                candidates.append(&mut rest);
                candidates
            }
        };

        let mut last_error: Option<TaskError> = None;
        for node in candidates {
            match self.transport.start_worker(&node, req.clone()).await {
                Ok(worker) => return Ok((node, worker)),
                Err(TransportError::Task(TaskError::NodeOverloaded(n))) => {
                    tracing::debug!(node = %n, handle = %req.handle, "node overloaded, trying next");
                    last_error = Some(TaskError::NodeOverloaded(n));
                }
                Err(TransportError::Unreachable(n)) => {
                    tracing::debug!(node = %n, handle = %req.handle, "node unreachable, trying next");
                    self.discovery.transport_down(n.clone()).await;
                    last_error = Some(TaskError::RemoteUnreachable(n));
                }
                Err(TransportError::Timeout(n)) => {
                    tracing::debug!(node = %n, handle = %req.handle, "dispatch timed out, trying next");
                    last_error = Some(TaskError::RemoteTimeout(n));
                }
                Err(TransportError::Unauthorized) => {
                    // A cookie mismatch will not improve on another node.
                    return Err(TransportError::Unauthorized.into_task_error());
                }
                Err(TransportError::Task(e)) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(TaskError::NoAvailableNode))
    }
}

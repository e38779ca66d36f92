//! Inter-node RPC surface.
//!
//! Every wire format is implementation-defined behind [`Transport`]; the
//! contracts that must hold are: operations are idempotent per
//! `(handle, attempt)`, payload bytes pass through unchanged, and
//! failures surface as timeouts or unreachability rather than hanging.
//! Requests carry an HMAC-SHA256 tag keyed by the cluster cookie.

pub mod in_process;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::node_id::NodeId;
use crate::task::{LifecycleEvent, StartWorker, TaskHandle, WorkerId};

type HmacSha256 = Hmac<Sha256>;

/// Asynchronous, at-least-once messaging between cluster members.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start one worker attempt on `node`. Idempotent: repeating the
    /// same `(handle, attempt)` returns the existing worker.
    async fn start_worker(
        &self,
        node: &NodeId,
        req: StartWorker,
    ) -> Result<WorkerId, TransportError>;

    /// Request a worker stop. `Ok(false)` when the worker is unknown.
    async fn cancel_worker(
        &self,
        node: &NodeId,
        worker: WorkerId,
    ) -> Result<bool, TransportError>;

    /// Refresh this node's liveness on `node`.
    async fn heartbeat(
        &self,
        node: &NodeId,
        from: &NodeId,
        at: DateTime<Utc>,
    ) -> Result<(), TransportError>;

    /// Route `node`'s worker lifecycle events into `sink`.
    async fn subscribe_lifecycle(
        &self,
        node: &NodeId,
        sink: mpsc::Sender<LifecycleEvent>,
    ) -> Result<(), TransportError>;

    /// Write worker progress through to the owning node's checkpoint
    /// store, preserving the single-writer-per-handle rule.
    async fn put_checkpoint(
        &self,
        owner: &NodeId,
        handle: TaskHandle,
        progress: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// Tag request parts with the shared cluster cookie.
pub(crate) fn sign(cookie: &str, parts: &[&str]) -> String {
    let mut mac = HmacSha256::new_from_slice(cookie.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(parts.join(":").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a request tag against this node's cookie.
pub(crate) fn verify(cookie: &str, parts: &[&str], tag: &str) -> bool {
    let Ok(expected) = hex::decode(tag) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(cookie.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(parts.join(":").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

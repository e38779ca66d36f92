//! In-process transport: routes requests between cluster nodes hosted in
//! one process. This is the embedded and test topology; wire transports
//! implement the same [`Transport`] trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use lattice_store::CheckpointStore;

use crate::discovery::Discovery;
use crate::error::TransportError;
use crate::node_id::NodeId;
use crate::snapshot;
use crate::supervisor::Supervisor;
use crate::task::{LifecycleEvent, StartWorker, TaskHandle, WorkerId};
use crate::transport::{Transport, sign, verify};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The endpoints a node exposes to its peers.
#[derive(Clone)]
pub struct NodeEndpoints {
    pub cookie: String,
    pub supervisor: Supervisor,
    pub discovery: Discovery,
    pub store: Arc<CheckpointStore>,
}

/// Shared routing table between in-process nodes.
#[derive(Default)]
pub struct InProcessHub {
    nodes: Mutex<HashMap<NodeId, NodeEndpoints>>,
}

impl InProcessHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node's endpoints routable.
    pub fn attach(&self, node: NodeId, endpoints: NodeEndpoints) {
        self.lock().insert(node, endpoints);
    }

    /// Remove a node from the routing table; subsequent requests to it
    /// fail as unreachable. Used to simulate node loss.
    pub fn detach(&self, node: &NodeId) -> bool {
        self.lock().remove(node).is_some()
    }

    fn endpoints(&self, node: &NodeId) -> Option<NodeEndpoints> {
        self.lock().get(node).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, NodeEndpoints>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's client onto the hub.
pub struct InProcessTransport {
    hub: Arc<InProcessHub>,
    local: NodeId,
    cookie: String,
    request_timeout: Duration,
}

impl InProcessTransport {
    pub fn new(hub: Arc<InProcessHub>, local: NodeId, cookie: &str) -> Self {
        Self {
            hub,
            local,
            cookie: cookie.to_string(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Resolve a peer and authenticate the request envelope against its
    /// cookie. Any authenticated contact doubles as a heartbeat.
    async fn connect(&self, node: &NodeId, op: &str) -> Result<NodeEndpoints, TransportError> {
        let endpoints = self
            .hub
            .endpoints(node)
            .ok_or_else(|| TransportError::Unreachable(node.clone()))?;

        let parts = [self.local.as_str(), op];
        let tag = sign(&self.cookie, &parts);
        if !verify(&endpoints.cookie, &parts, &tag) {
            return Err(TransportError::Unauthorized);
        }

        endpoints
            .discovery
            .heartbeat(self.local.clone(), Utc::now())
            .await;
        Ok(endpoints)
    }

    async fn with_timeout<T>(
        &self,
        node: &NodeId,
        fut: impl Future<Output = T>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout(node.clone()))
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn start_worker(
        &self,
        node: &NodeId,
        req: StartWorker,
    ) -> Result<WorkerId, TransportError> {
        let endpoints = self.connect(node, "start_worker").await?;
        self.with_timeout(node, endpoints.supervisor.start(req))
            .await?
            .map_err(TransportError::Task)
    }

    async fn cancel_worker(
        &self,
        node: &NodeId,
        worker: WorkerId,
    ) -> Result<bool, TransportError> {
        let endpoints = self.connect(node, "cancel_worker").await?;
        self.with_timeout(node, endpoints.supervisor.stop(worker)).await
    }

    async fn heartbeat(
        &self,
        node: &NodeId,
        from: &NodeId,
        at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        let endpoints = self.connect(node, "heartbeat").await?;
        self.with_timeout(node, endpoints.discovery.heartbeat(from.clone(), at))
            .await
    }

    async fn subscribe_lifecycle(
        &self,
        node: &NodeId,
        sink: mpsc::Sender<LifecycleEvent>,
    ) -> Result<(), TransportError> {
        let endpoints = self.connect(node, "subscribe_lifecycle").await?;
        self.with_timeout(node, endpoints.supervisor.subscribe(sink))
            .await
    }

    async fn put_checkpoint(
        &self,
        owner: &NodeId,
        handle: TaskHandle,
        progress: Vec<u8>,
    ) -> Result<(), TransportError> {
        let endpoints = self.connect(owner, "put_checkpoint").await?;
        snapshot::record_progress(&endpoints.store, handle, &progress)
            .map_err(|e| TransportError::Task(crate::error::TaskError::TaskFailed(e.to_string())))
    }
}

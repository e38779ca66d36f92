//! Node wiring: construct the core components and connect them.
//!
//! Construction order is the recovery order: checkpoint store first
//! (reloading durable snapshots), then discovery, worker supervisor,
//! recovery monitor, distributor. Everything is passed explicitly; there
//! is no ambient registry of components.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lattice_store::{CheckpointStore, StoreError};

use crate::config::CoreConfig;
use crate::discovery::Discovery;
use crate::distributor::Distributor;
use crate::error::TaskError;
use crate::node_id::NodeId;
use crate::placement::{Placer, SelectionPolicy, build_policy};
use crate::processor::PatternProcessor;
use crate::recovery::Recovery;
use crate::registry::FunctionRegistry;
use crate::supervision::RestartIntensity;
use crate::supervisor::Supervisor;
use crate::transport::Transport;
use crate::transport::in_process::NodeEndpoints;

/// Errors that keep a node from starting.
#[derive(Debug, thiserror::Error)]
pub enum NodeStartError {
    #[error("checkpoint store: {0}")]
    Store(#[from] StoreError),

    #[error("selection policy: {0}")]
    Policy(String),
}

/// One cluster member: the five core components wired together over a
/// shared function registry and transport.
pub struct ClusterNode {
    config: CoreConfig,
    registry: Arc<FunctionRegistry>,
    store: Arc<CheckpointStore>,
    discovery: Discovery,
    supervisor: Supervisor,
    distributor: Distributor,
    heartbeat: JoinHandle<()>,
}

impl ClusterNode {
    /// Start a node with the built-in selection policies.
    pub async fn start(
        config: CoreConfig,
        registry: FunctionRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, NodeStartError> {
        Self::start_with_policies(config, registry, transport, HashMap::new()).await
    }

    /// Start a node, making `custom:<name>` policies resolvable.
    pub async fn start_with_policies(
        config: CoreConfig,
        registry: FunctionRegistry,
        transport: Arc<dyn Transport>,
        custom_policies: HashMap<String, Arc<dyn SelectionPolicy>>,
    ) -> Result<Self, NodeStartError> {
        let local = config.cluster.node_id.clone();
        let intensity = RestartIntensity::from(&config.supervisor);

        let store = Arc::new(CheckpointStore::open(&config.checkpoint)?);
        spawn_store_flusher(&store, config.checkpoint.flush_interval_ms);

        let registry = Arc::new(registry);
        let discovery = Discovery::spawn(&config.discovery, intensity);
        let supervisor = Supervisor::spawn(
            local.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&transport),
            &config.supervisor,
        );

        let policy = build_policy(&config.distributor.selection_policy, &custom_policies)
            .map_err(NodeStartError::Policy)?;
        let placer = Placer {
            discovery: discovery.clone(),
            policy,
            transport: Arc::clone(&transport),
            local: local.clone(),
        };

        let (updates_tx, updates_rx) = mpsc::channel(512);
        let recovery = Recovery::spawn(
            placer.clone(),
            Arc::clone(&store),
            updates_tx,
            intensity,
        );
        let distributor = Distributor::spawn(
            local.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            placer,
            recovery.clone(),
            updates_rx,
            &config.distributor,
            config.recovery.clone(),
            intensity,
        );

        // Local wiring: worker exits and membership changes feed the
        // recovery monitor; the node is a member of its own cluster.
        supervisor.subscribe(recovery.lifecycle_sink()).await;
        discovery.subscribe(recovery.membership_sink()).await;
        discovery.register(local.clone()).await;

        let heartbeat = spawn_heartbeat_loop(
            local.clone(),
            discovery.clone(),
            Arc::clone(&transport),
            config.discovery.heartbeat_interval(),
        );

        tracing::info!(node = %local, "cluster node started");
        Ok(Self {
            config,
            registry,
            store,
            discovery,
            supervisor,
            distributor,
            heartbeat,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.cluster.node_id
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// A split/aggregate adapter bound to this node's distributor.
    pub fn processor(&self) -> PatternProcessor {
        PatternProcessor::new(self.distributor.clone())
    }

    /// The endpoints peers use to reach this node over an in-process
    /// hub.
    pub fn endpoints(&self) -> NodeEndpoints {
        NodeEndpoints {
            cookie: self.config.cluster.cookie.clone(),
            supervisor: self.supervisor.clone(),
            discovery: self.discovery.clone(),
            store: Arc::clone(&self.store),
        }
    }

    /// Explicit membership hint; see
    /// [`Distributor::register_worker_node`].
    pub async fn register_worker_node(&self, node: NodeId) -> Result<(), TaskError> {
        self.distributor.register_worker_node(node).await
    }

    /// Re-place tasks left in a durable store by a previous life. Call
    /// once this node is reachable over its transport.
    pub async fn recover_from_store(&self) {
        self.distributor.recover_from_store().await;
    }

    /// Stop periodic work and flush pending checkpoints.
    pub async fn shutdown(self) {
        self.heartbeat.abort();
        if let Err(e) = self.store.flush() {
            tracing::warn!(error = %e, "checkpoint flush on shutdown failed");
        }
        tracing::info!(node = %self.config.cluster.node_id, "cluster node stopped");
    }
}

fn spawn_store_flusher(store: &Arc<CheckpointStore>, interval_ms: u64) {
    if !store.is_durable() || interval_ms == 0 {
        return;
    }

    // Weak so the flusher dies with the node instead of pinning the
    // store.
    let store = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else { return };
            if let Err(e) = store.flush() {
                tracing::warn!(error = %e, "periodic checkpoint flush failed");
            }
        }
    });
}

fn spawn_heartbeat_loop(
    local: NodeId,
    discovery: Discovery,
    transport: Arc<dyn Transport>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            discovery.heartbeat(local.clone(), Utc::now()).await;

            for peer in discovery.list_up().await {
                if peer == local {
                    continue;
                }
                if let Err(e) = transport.heartbeat(&peer, &local, Utc::now()).await {
                    tracing::debug!(peer = %peer, error = %e, "heartbeat failed");
                    discovery.transport_down(peer).await;
                }
            }
        }
    })
}

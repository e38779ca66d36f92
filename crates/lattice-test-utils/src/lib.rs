//! Shared fixtures for lattice integration tests.
//!
//! Stands up fully meshed in-process clusters with fast timers and a
//! canned set of task functions (`double`, `flaky`, `always_fails`,
//! `sleepy_double`, `sleep_forever`, `resume_or_crash`, `echo`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use lattice_core::cluster::ClusterNode;
use lattice_core::config::CoreConfig;
use lattice_core::node_id::NodeId;
use lattice_core::registry::FunctionRegistry;
use lattice_core::transport::Transport;
use lattice_core::transport::in_process::{InProcessHub, InProcessTransport};

pub const TEST_COOKIE: &str = "test-cookie";

/// Poll `probe` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Name the i-th cluster member.
pub fn node_name(index: usize) -> NodeId {
    NodeId::new(format!("n{index}@test"))
}

/// Encode an integer payload the way the canned functions expect.
pub fn int_payload(value: i64) -> Vec<u8> {
    serde_json::to_vec(&value).expect("integer payload encodes")
}

/// Decode an integer payload produced by the canned functions.
pub fn parse_int(bytes: &[u8]) -> i64 {
    serde_json::from_slice(bytes).expect("integer payload decodes")
}

/// An in-process cluster plus the counters its functions expose.
pub struct TestCluster {
    pub hub: Arc<InProcessHub>,
    pub nodes: Vec<ClusterNode>,
    /// Calls observed by `flaky` (and friends) across the cluster.
    pub calls: Arc<AtomicU32>,
}

impl TestCluster {
    /// Start `n` meshed nodes with fast test timers.
    pub async fn start(n: usize) -> Self {
        Self::start_with(n, |_, _| {}).await
    }

    /// Start `n` meshed nodes, letting the caller adjust each node's
    /// config before it boots.
    pub async fn start_with(n: usize, tweak: impl Fn(usize, &mut CoreConfig)) -> Self {
        let hub = InProcessHub::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut nodes = Vec::with_capacity(n);

        for index in 0..n {
            let mut config = fast_config(index);
            tweak(index, &mut config);

            let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(
                Arc::clone(&hub),
                config.cluster.node_id.clone(),
                &config.cluster.cookie,
            ));
            let node = ClusterNode::start(config, test_registry(&calls), transport)
                .await
                .expect("test node starts");
            hub.attach(node.node_id().clone(), node.endpoints());
            node.recover_from_store().await;
            nodes.push(node);
        }

        // Full mesh: every node knows every other.
        for a in 0..n {
            for b in 0..n {
                if a != b {
                    nodes[a]
                        .register_worker_node(nodes[b].node_id().clone())
                        .await
                        .expect("mesh registration");
                }
            }
        }

        Self { hub, nodes, calls }
    }

    pub fn node(&self, index: usize) -> &ClusterNode {
        &self.nodes[index]
    }

    /// Simulate a node crash: unroute it and kill its workers.
    pub async fn kill(&self, index: usize) {
        let node = &self.nodes[index];
        self.hub.detach(node.node_id());
        node.supervisor().restart().await;
    }
}

/// Single-node config with millisecond-scale timers.
pub fn fast_config(index: usize) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.cluster.node_id = node_name(index);
    config.cluster.cookie = TEST_COOKIE.to_string();
    config.discovery.heartbeat_interval_ms = 50;
    config.discovery.cleanup_interval_ms = 200;
    config.supervisor.shutdown_window_ms = 200;
    config.recovery.max_attempts = 3;
    config.recovery.initial_backoff_ms = 10;
    config.recovery.max_backoff_ms = 100;
    config.distributor.default_task_timeout_ms = 5_000;
    config
}

/// The canned function set. `calls` counts invocations of the failing
/// functions so tests can assert attempt counts.
pub fn test_registry(calls: &Arc<AtomicU32>) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry.register_fn("echo", |input, _ctx| async move { Ok(input) });

    registry.register_fn("double", |input, _ctx| async move {
        let value: i64 =
            serde_json::from_slice(&input).map_err(|e| format!("bad input: {e}"))?;
        serde_json::to_vec(&(value + value)).map_err(|e| e.to_string())
    });

    let flaky_calls = Arc::clone(calls);
    registry.register_fn("flaky", move |_input, _ctx| {
        let calls = Arc::clone(&flaky_calls);
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(format!("flaky failure on call {call}"))
            } else {
                Ok(b"ok".to_vec())
            }
        }
    });

    let failing_calls = Arc::clone(calls);
    registry.register_fn("always_fails", move |_input, _ctx| {
        let calls = Arc::clone(&failing_calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        }
    });

    registry.register_fn("sleepy_double", |input, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let value: i64 =
            serde_json::from_slice(&input).map_err(|e| format!("bad input: {e}"))?;
        serde_json::to_vec(&(value + value)).map_err(|e| e.to_string())
    });

    registry.register_fn("sleep_forever", |_input, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(vec![])
    });

    // Fails once after saving progress; the retry resumes from it.
    registry.register_fn("resume_or_crash", |_input, ctx| async move {
        if ctx.checkpoint() == Some(b"state-42".as_slice()) {
            Ok(b"resumed".to_vec())
        } else {
            ctx.save_checkpoint(b"state-42").await;
            Err("crashed after checkpoint".to_string())
        }
    });

    registry
}

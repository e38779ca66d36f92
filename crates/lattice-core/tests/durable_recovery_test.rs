//! Durable checkpoints across a node restart: bytes round-trip exactly
//! and the recovered task resumes from its saved progress.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lattice_core::cluster::ClusterNode;
use lattice_core::config::{CheckpointMode, CoreConfig};
use lattice_core::registry::FunctionRegistry;
use lattice_core::snapshot::TaskSnapshot;
use lattice_core::task::{SubmitOptions, TaskStatus};
use lattice_core::transport::Transport;
use lattice_core::transport::in_process::{InProcessHub, InProcessTransport};
use lattice_test_utils::{eventually, fast_config};

fn durable_config(dir: &Path) -> CoreConfig {
    let mut config = fast_config(0);
    config.checkpoint.mode = CheckpointMode::Durable;
    config.checkpoint.durable_path = Some(dir.to_path_buf());
    config.checkpoint.flush_interval_ms = 50;
    config
}

fn durable_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    // First run saves progress and hangs; the post-restart run resumes.
    registry.register_fn("save_then_hang", |_input, ctx| async move {
        if ctx.checkpoint() == Some(b"state-42".as_slice()) {
            Ok(b"resumed".to_vec())
        } else {
            ctx.save_checkpoint(b"state-42").await;
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(vec![])
        }
    });
    registry
}

async fn start_node(dir: &Path) -> ClusterNode {
    let config = durable_config(dir);
    let hub = InProcessHub::new();
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(
        Arc::clone(&hub),
        config.cluster.node_id.clone(),
        &config.cluster.cookie,
    ));
    let node = ClusterNode::start(config, durable_registry(), transport)
        .await
        .expect("node starts");
    hub.attach(node.node_id().clone(), node.endpoints());
    node.recover_from_store().await;
    node
}

#[tokio::test]
async fn checkpoint_survives_restart_and_resumes_the_task() {
    let tmp = tempfile::TempDir::new().unwrap();

    // First life: run until the worker has persisted its progress.
    let node = start_node(tmp.path()).await;
    let receipt = node
        .distributor()
        .submit(
            vec![],
            "save_then_hang",
            SubmitOptions {
                timeout: Some(Duration::from_secs(30)),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let handle = receipt.handle;

    let store = Arc::clone(node.store());
    assert!(
        eventually(Duration::from_secs(2), || {
            let store = Arc::clone(&store);
            async move {
                store
                    .get(handle.as_uuid())
                    .and_then(|bytes| TaskSnapshot::decode(&bytes).ok())
                    .and_then(|snapshot| snapshot.progress)
                    .as_deref()
                    == Some(b"state-42".as_slice())
            }
        })
        .await,
        "worker progress should reach the store"
    );
    drop(receipt);
    node.shutdown().await;
    drop(store);

    // The stored bytes round-trip unchanged through the restart.
    {
        let raw = lattice_store::CheckpointStore::open(&durable_config(tmp.path()).checkpoint)
            .expect("store reopens");
        let bytes = raw.get(handle.as_uuid()).expect("envelope survived");
        let snapshot = TaskSnapshot::decode(&bytes).unwrap();
        assert_eq!(snapshot.progress.as_deref(), Some(b"state-42".as_slice()));
        assert_eq!(snapshot.fn_id, "save_then_hang");
    }

    // Second life: startup rediscovery re-places the task with its
    // checkpoint; the function observes it and completes.
    let reborn = start_node(tmp.path()).await;
    let distributor = reborn.distributor();
    assert!(
        eventually(Duration::from_secs(5), || async move {
            distributor.status(handle).await == Some(TaskStatus::Completed)
        })
        .await,
        "recovered task should resume and complete"
    );
    assert_eq!(reborn.store().get(handle.as_uuid()), None);
}

#[tokio::test]
async fn ephemeral_mode_recovers_nothing() {
    let tmp = tempfile::TempDir::new().unwrap();

    // A durable first life leaves an envelope behind.
    let node = start_node(tmp.path()).await;
    let receipt = node
        .distributor()
        .submit(vec![], "save_then_hang", SubmitOptions::default())
        .await
        .unwrap();
    let handle = receipt.handle;
    let store = Arc::clone(node.store());
    assert!(
        eventually(Duration::from_secs(2), || {
            let store = Arc::clone(&store);
            async move { store.get(handle.as_uuid()).is_some() }
        })
        .await
    );
    drop(receipt);
    node.shutdown().await;
    drop(store);

    // An ephemeral restart ignores the directory entirely.
    let mut config = fast_config(0);
    config.checkpoint.mode = CheckpointMode::Ephemeral;
    let hub = InProcessHub::new();
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(
        Arc::clone(&hub),
        config.cluster.node_id.clone(),
        &config.cluster.cookie,
    ));
    let reborn = ClusterNode::start(config, durable_registry(), transport)
        .await
        .unwrap();
    hub.attach(reborn.node_id().clone(), reborn.endpoints());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(reborn.distributor().status(handle).await, None);
}

//! Cluster membership and node loss mid-execution.

use std::time::Duration;

use lattice_core::task::{SubmitOptions, TaskStatus};
use lattice_test_utils::{TestCluster, eventually, int_payload, node_name, parse_int};

#[tokio::test]
async fn members_see_each_other_up() {
    let cluster = TestCluster::start(3).await;

    for i in 0..3 {
        let up = cluster.node(i).discovery().list_up().await;
        assert_eq!(up.len(), 3, "node {i} sees {up:?}");
    }
}

#[tokio::test]
async fn dead_node_is_pruned_from_peers() {
    use futures::StreamExt;
    use lattice_core::discovery::MembershipEvent;

    let cluster = TestCluster::start(2).await;
    let mut events = cluster.node(0).discovery().watch().await;

    cluster.kill(1).await;

    // A Down event for the dead node arrives, and the up set shrinks.
    let down = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(event) = events.next().await {
            if let MembershipEvent::Down { node, .. } = event {
                if node == node_name(1) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert!(matches!(down, Ok(true)), "expected a Down event for the dead node");

    let discovery = cluster.node(0).discovery();
    assert!(
        eventually(Duration::from_secs(3), || async move {
            !discovery.list_up().await.contains(&node_name(1))
        })
        .await,
        "peer should drop the dead node"
    );
}

#[tokio::test]
async fn task_on_lost_node_is_retried_elsewhere() {
    let cluster = TestCluster::start(2).await;
    let distributor = cluster.node(0).distributor();

    // Pin a slow task to the node that is about to die.
    let receipt = distributor
        .submit(
            int_payload(21),
            "sleepy_double",
            SubmitOptions {
                target_node: Some(node_name(1)),
                max_attempts: Some(3),
                initial_backoff_ms: Some(10),
                max_backoff_ms: Some(100),
                timeout: Some(Duration::from_secs(10)),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let handle = receipt.handle;

    // Let the worker start on n1, then take n1 down mid-execution.
    assert!(
        eventually(Duration::from_secs(2), || async move {
            distributor.status(handle).await == Some(TaskStatus::Running)
        })
        .await
    );
    cluster.kill(1).await;

    // The retry lands on the surviving node and produces the natural
    // result.
    let value = receipt.result().await.expect("retried on the other node");
    assert_eq!(parse_int(&value), 42);
    assert_eq!(
        distributor.status(handle).await,
        Some(TaskStatus::Completed)
    );
    assert_eq!(cluster.node(0).store().get(handle.as_uuid()), None);
}

#[tokio::test]
async fn lost_node_with_exhausted_attempts_fails_the_task() {
    let cluster = TestCluster::start(2).await;
    let distributor = cluster.node(0).distributor();

    // One attempt only: losing the node must fail the task rather than
    // retry it.
    let receipt = distributor
        .submit(
            vec![],
            "sleep_forever",
            SubmitOptions {
                target_node: Some(node_name(1)),
                max_attempts: Some(1),
                timeout: Some(Duration::from_secs(10)),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let handle = receipt.handle;

    assert!(
        eventually(Duration::from_secs(2), || async move {
            distributor.status(handle).await == Some(TaskStatus::Running)
        })
        .await
    );
    cluster.kill(1).await;

    let result = receipt.result().await;
    assert!(result.is_err(), "expected failure, got {result:?}");
    assert_eq!(distributor.status(handle).await, Some(TaskStatus::Failed));
}

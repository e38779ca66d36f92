//! Caller-facing distributor behavior: submission, status, options, and
//! the immediate error surface.

use std::time::Duration;

use tokio::sync::mpsc;

use lattice_core::error::TaskError;
use lattice_core::node_id::NodeId;
use lattice_core::task::{SubmitOptions, TaskHandle, TaskOutcome, TaskStatus};
use lattice_test_utils::{TestCluster, eventually, int_payload, node_name, parse_int};

#[tokio::test]
async fn happy_path_single_node() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(int_payload(7), "double", SubmitOptions::default())
        .await
        .expect("submit accepted");
    let handle = receipt.handle;

    let value = receipt.result().await.expect("task completes");
    assert_eq!(parse_int(&value), 14);

    // The checkpoint entry is gone once the task is terminal.
    assert_eq!(cluster.node(0).store().get(handle.as_uuid()), None);
    assert_eq!(
        distributor.status(handle).await,
        Some(TaskStatus::Completed)
    );

    let info = distributor.inspect(handle).await.expect("record retained");
    assert_eq!(info.fn_id, "double");
    assert_eq!(info.attempt, 1);
    assert_eq!(info.assigned_node, Some(node_name(0)));
    assert!(info.started_at.is_some());
    assert!(info.finished_at >= info.started_at);
}

#[tokio::test]
async fn status_is_monotonic_after_completion() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(int_payload(1), "double", SubmitOptions::default())
        .await
        .unwrap();
    let handle = receipt.handle;
    receipt.result().await.unwrap();

    for _ in 0..5 {
        assert_eq!(
            distributor.status(handle).await,
            Some(TaskStatus::Completed)
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

#[tokio::test]
async fn unknown_function_is_an_immediate_error() {
    let cluster = TestCluster::start(1).await;

    let result = cluster
        .node(0)
        .distributor()
        .submit(b"x".to_vec(), "no_such_fn", SubmitOptions::default())
        .await;
    assert!(matches!(result, Err(TaskError::UnknownFunction(name)) if name == "no_such_fn"));
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let cluster = TestCluster::start(1).await;

    let result = cluster
        .node(0)
        .distributor()
        .submit(
            b"x".to_vec(),
            "echo",
            SubmitOptions {
                max_attempts: Some(0),
                ..SubmitOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(TaskError::InvalidOptions(_))));
}

#[tokio::test]
async fn status_of_unknown_handle_is_none() {
    let cluster = TestCluster::start(1).await;
    assert_eq!(
        cluster.node(0).distributor().status(TaskHandle::mint()).await,
        None
    );
}

#[tokio::test]
async fn inline_submission_bypasses_the_supervisor() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(
            int_payload(21),
            "double",
            SubmitOptions {
                distributed: false,
                ..SubmitOptions::default()
            },
        )
        .await
        .expect("inline submit");
    let handle = receipt.handle;

    assert_eq!(parse_int(&receipt.result().await.unwrap()), 42);
    assert_eq!(
        distributor.status(handle).await,
        Some(TaskStatus::Completed)
    );
}

#[tokio::test]
async fn inline_failure_surfaces_as_task_failed() {
    let cluster = TestCluster::start(1).await;

    let receipt = cluster
        .node(0)
        .distributor()
        .submit(
            vec![],
            "always_fails",
            SubmitOptions {
                distributed: false,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let result = receipt.result().await;
    assert!(matches!(result, Err(TaskError::TaskFailed(reason)) if reason == "boom"));
    // Inline execution is a single call, never retried.
    assert_eq!(cluster.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ref_mode_resolves_at_placement_then_completes() {
    let cluster = TestCluster::start(1).await;

    let mut receipt = cluster
        .node(0)
        .distributor()
        .submit(
            b"payload".to_vec(),
            "echo",
            SubmitOptions {
                return_ref_mode: true,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let handle = receipt.handle;

    match receipt.wait().await {
        TaskOutcome::Accepted(acked) => assert_eq!(acked, handle),
        // A fast worker may finalize before the placement ack; both
        // shapes deliver exactly one terminal outcome.
        TaskOutcome::Completed(value) => {
            assert_eq!(value, b"payload");
            return;
        }
        TaskOutcome::Failed(e) => panic!("unexpected failure: {e}"),
    }

    match receipt.completed().await {
        TaskOutcome::Completed(value) => assert_eq!(value, b"payload"),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn caller_timeout_does_not_cancel_the_task() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(
            vec![],
            "sleep_forever",
            SubmitOptions {
                timeout: Some(Duration::from_millis(100)),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let handle = receipt.handle;

    let result = receipt.result().await;
    assert!(matches!(result, Err(TaskError::TaskTimedOut)));

    // The worker is still running in the background.
    assert!(
        eventually(Duration::from_secs(2), || async move {
            distributor.status(handle).await == Some(TaskStatus::Running)
        })
        .await
    );
}

#[tokio::test]
async fn target_node_override_places_on_that_node() {
    let cluster = TestCluster::start(2).await;

    // Watch the target's supervisor directly to confirm placement.
    let (tx, mut rx) = mpsc::channel(16);
    cluster.node(1).supervisor().subscribe(tx).await;

    let receipt = cluster
        .node(0)
        .distributor()
        .submit(
            b"pin".to_vec(),
            "echo",
            SubmitOptions {
                target_node: Some(node_name(1)),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let handle = receipt.handle;

    assert_eq!(receipt.result().await.unwrap(), b"pin");

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("lifecycle event from target")
        .expect("channel open");
    assert_eq!(event.handle, handle);
    assert_eq!(event.node, node_name(1));
}

#[tokio::test]
async fn unknown_target_node_fails_with_no_such_node() {
    let cluster = TestCluster::start(1).await;

    let result = cluster
        .node(0)
        .distributor()
        .submit(
            vec![],
            "echo",
            SubmitOptions {
                target_node: Some(NodeId::new("ghost@test")),
                ..SubmitOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(TaskError::NoSuchNode(node)) if node.as_str() == "ghost@test"));
}

#[tokio::test]
async fn empty_up_set_fails_with_no_available_node() {
    // Heartbeats far apart, sweep fast: the node prunes itself.
    let cluster = TestCluster::start_with(1, |_, config| {
        config.discovery.heartbeat_interval_ms = 60_000;
        config.discovery.cleanup_interval_ms = 50;
    })
    .await;
    let node = cluster.node(0);
    let discovery = node.discovery();

    assert!(
        eventually(Duration::from_secs(2), || async move {
            discovery.list_up().await.is_empty()
        })
        .await
    );

    let result = node
        .distributor()
        .submit(vec![], "echo", SubmitOptions::default())
        .await;
    assert!(matches!(result, Err(TaskError::NoAvailableNode)));
}

#[tokio::test]
async fn concurrent_submissions_each_resolve_once() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor().clone();

    let mut joins = Vec::new();
    for i in 0..16i64 {
        let distributor = distributor.clone();
        joins.push(tokio::spawn(async move {
            let receipt = distributor
                .submit(int_payload(i), "double", SubmitOptions::default())
                .await
                .expect("submit");
            parse_int(&receipt.result().await.expect("completes"))
        }));
    }

    for (i, join) in joins.into_iter().enumerate() {
        assert_eq!(join.await.unwrap(), (i as i64) * 2);
    }
}

//! Retry policy end to end: backoff, exhaustion, cancellation, and
//! checkpoint resumption.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use lattice_core::error::TaskError;
use lattice_core::task::{SubmitOptions, TaskStatus};
use lattice_test_utils::{TestCluster, eventually};

fn retry_opts(max_attempts: u32, initial_ms: u64, max_ms: u64) -> SubmitOptions {
    SubmitOptions {
        max_attempts: Some(max_attempts),
        initial_backoff_ms: Some(initial_ms),
        max_backoff_ms: Some(max_ms),
        ..SubmitOptions::default()
    }
}

#[tokio::test]
async fn flaky_function_succeeds_on_third_attempt() {
    let cluster = TestCluster::start(1).await;

    let started = Instant::now();
    let receipt = cluster
        .node(0)
        .distributor()
        .submit(vec![], "flaky", retry_opts(3, 10, 100))
        .await
        .unwrap();

    let handle = receipt.handle;
    let value = receipt.result().await.expect("third attempt succeeds");
    assert_eq!(value, b"ok");
    assert_eq!(cluster.calls.load(Ordering::SeqCst), 3);

    let info = cluster
        .node(0)
        .distributor()
        .inspect(handle)
        .await
        .expect("record retained");
    assert_eq!(info.attempt, 3);

    // Two backoffs were observed: ~10 ms then ~20 ms.
    assert!(
        started.elapsed() >= Duration::from_millis(30),
        "retries came back too fast: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn exhausted_retries_preserve_the_original_reason() {
    let cluster = TestCluster::start(1).await;

    let receipt = cluster
        .node(0)
        .distributor()
        .submit(vec![], "always_fails", retry_opts(3, 10, 100))
        .await
        .unwrap();
    let handle = receipt.handle;

    let result = receipt.result().await;
    assert!(matches!(result, Err(TaskError::TaskFailed(reason)) if reason == "boom"));
    assert_eq!(cluster.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        cluster.node(0).distributor().status(handle).await,
        Some(TaskStatus::Failed)
    );
    // Terminal transition removed the checkpoint.
    assert_eq!(cluster.node(0).store().get(handle.as_uuid()), None);
}

#[tokio::test]
async fn backoff_doubles_up_to_the_cap() {
    let cluster = TestCluster::start(1).await;

    // Five attempts with cap 40: delays 20, 40, 40, 40.
    let started = Instant::now();
    let receipt = cluster
        .node(0)
        .distributor()
        .submit(vec![], "always_fails", retry_opts(5, 20, 40))
        .await
        .unwrap();

    let result = receipt.result().await;
    assert!(result.is_err());
    assert_eq!(cluster.calls.load(Ordering::SeqCst), 5);
    assert!(
        started.elapsed() >= Duration::from_millis(140),
        "backoff sequence too short: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn cancel_during_backoff_terminates_immediately() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(vec![], "always_fails", retry_opts(5, 1_000, 30_000))
        .await
        .unwrap();
    let handle = receipt.handle;

    // Wait for the first failure to park the task in backoff.
    let calls = &cluster.calls;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            calls.load(Ordering::SeqCst) >= 1
                && distributor.status(handle).await == Some(TaskStatus::Pending)
        })
        .await
    );

    let cancel_started = Instant::now();
    distributor.cancel(handle).await;

    assert!(
        eventually(Duration::from_millis(100), || async move {
            distributor.status(handle).await == Some(TaskStatus::Cancelled)
        })
        .await,
        "cancel during backoff should settle within 100ms"
    );
    assert!(cancel_started.elapsed() < Duration::from_millis(200));

    let result = receipt.result().await;
    assert!(matches!(result, Err(TaskError::TaskCancelled)));

    // The backoff timer died with the task: no further attempts.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(cluster.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_running_task_stops_the_worker() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(vec![], "sleep_forever", SubmitOptions::default())
        .await
        .unwrap();
    let handle = receipt.handle;

    assert!(
        eventually(Duration::from_secs(2), || async move {
            distributor.status(handle).await == Some(TaskStatus::Running)
        })
        .await
    );

    use lattice_core::task::CancelStatus;
    assert_eq!(distributor.cancel(handle).await, CancelStatus::Ok);

    assert!(
        eventually(Duration::from_secs(1), || async move {
            distributor.status(handle).await == Some(TaskStatus::Cancelled)
        })
        .await
    );
    assert!(matches!(
        receipt.result().await,
        Err(TaskError::TaskCancelled)
    ));
}

#[tokio::test]
async fn cancel_terminal_task_reports_already_terminal() {
    let cluster = TestCluster::start(1).await;
    let distributor = cluster.node(0).distributor();

    let receipt = distributor
        .submit(lattice_test_utils::int_payload(1), "double", SubmitOptions::default())
        .await
        .unwrap();
    let handle = receipt.handle;
    receipt.result().await.unwrap();

    use lattice_core::task::CancelStatus;
    assert_eq!(
        distributor.cancel(handle).await,
        CancelStatus::AlreadyTerminal
    );
    assert_eq!(
        distributor.cancel(lattice_core::task::TaskHandle::mint()).await,
        CancelStatus::NotFound
    );
}

#[tokio::test]
async fn retry_resumes_from_the_saved_checkpoint() {
    let cluster = TestCluster::start(1).await;

    let receipt = cluster
        .node(0)
        .distributor()
        .submit(vec![], "resume_or_crash", retry_opts(3, 10, 100))
        .await
        .unwrap();

    let value = receipt.result().await.expect("resumed attempt succeeds");
    assert_eq!(value, b"resumed");
}

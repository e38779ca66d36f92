//! Split/aggregate jobs through the pattern processor.

use std::sync::Arc;
use std::time::Duration;

use lattice_core::error::TaskError;
use lattice_core::processor::{Aggregator, ProcessOptions, Splitter};
use lattice_core::task::TaskStatus;
use lattice_test_utils::{TestCluster, eventually, int_payload};

#[tokio::test]
async fn identity_job_round_trips() {
    let cluster = TestCluster::start(1).await;
    let processor = cluster.node(0).processor();

    let job = processor
        .process(b"hello", ProcessOptions::new("echo"))
        .await
        .expect("job placed");
    assert_eq!(job.sub_jobs.len(), 1);

    assert_eq!(job.result().await.unwrap(), b"hello");
}

/// Splits a JSON integer array into one sub-job per element.
struct ArraySplitter;

impl Splitter for ArraySplitter {
    fn split(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let values: Vec<i64> = serde_json::from_slice(pattern).unwrap_or_default();
        values.into_iter().map(int_payload).collect()
    }
}

/// Sums integer outputs; insensitive to completion order.
struct SumAggregator;

impl Aggregator for SumAggregator {
    fn aggregate(&self, outputs: Vec<Vec<u8>>) -> Vec<u8> {
        let total: i64 = outputs
            .iter()
            .map(|bytes| serde_json::from_slice::<i64>(bytes).unwrap_or(0))
            .sum();
        int_payload(total)
    }
}

#[tokio::test]
async fn fan_out_aggregates_all_sub_jobs() {
    let cluster = TestCluster::start(2).await;
    let processor = cluster
        .node(0)
        .processor()
        .with_splitter(Arc::new(ArraySplitter))
        .with_aggregator(Arc::new(SumAggregator));

    let pattern = serde_json::to_vec(&vec![1i64, 2, 3, 4]).unwrap();
    let job = processor
        .process(&pattern, ProcessOptions::new("double"))
        .await
        .expect("job placed");
    assert_eq!(job.sub_jobs.len(), 4);

    // double(1) + double(2) + double(3) + double(4) = 20
    let value = job.result().await.unwrap();
    assert_eq!(serde_json::from_slice::<i64>(&value).unwrap(), 20);
}

#[tokio::test]
async fn empty_split_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let processor = cluster
        .node(0)
        .processor()
        .with_splitter(Arc::new(ArraySplitter));

    let result = processor
        .process(b"[]", ProcessOptions::new("double"))
        .await;
    assert!(matches!(result.err(), Some(TaskError::InvalidOptions(_))));
}

#[tokio::test]
async fn job_timeout_cancels_outstanding_sub_jobs() {
    let cluster = TestCluster::start(1).await;
    let processor = cluster.node(0).processor();

    let job = processor
        .process(
            b"stuck",
            ProcessOptions {
                task_timeout: Some(Duration::from_millis(200)),
                ..ProcessOptions::new("sleep_forever")
            },
        )
        .await
        .expect("job placed");
    let sub_jobs = job.sub_jobs.clone();

    let result = job.result().await;
    assert!(matches!(result, Err(TaskError::TaskTimedOut)));

    let distributor = cluster.node(0).distributor();
    for handle in sub_jobs {
        assert!(
            eventually(Duration::from_secs(2), || async move {
                distributor.status(handle).await == Some(TaskStatus::Cancelled)
            })
            .await,
            "sub-job should be cancelled after the job deadline"
        );
    }
}

#[tokio::test]
async fn sub_job_failure_fails_the_job() {
    let cluster = TestCluster::start(1).await;
    let processor = cluster.node(0).processor();

    let job = processor
        .process(
            b"doomed",
            ProcessOptions {
                submit: lattice_core::task::SubmitOptions {
                    max_attempts: Some(2),
                    initial_backoff_ms: Some(10),
                    max_backoff_ms: Some(50),
                    ..Default::default()
                },
                ..ProcessOptions::new("always_fails")
            },
        )
        .await
        .expect("job placed");

    let result = job.result().await;
    assert!(matches!(result, Err(TaskError::TaskFailed(reason)) if reason == "boom"));
}

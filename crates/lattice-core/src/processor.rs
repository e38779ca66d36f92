//! Pattern processor: the split/aggregate adapter on top of the
//! distributor.
//!
//! A job is split into sub-jobs (identity split by default), each
//! submitted in ref mode so `process` can return as soon as every
//! sub-job is placed. Outputs aggregate in completion order; a job-level
//! timeout cancels stragglers and discards partial results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::distributor::Distributor;
use crate::error::TaskError;
use crate::task::{SubmitOptions, TaskHandle, TaskOutcome};

/// Splits one pattern into sub-job inputs.
pub trait Splitter: Send + Sync {
    fn split(&self, pattern: &[u8]) -> Vec<Vec<u8>>;
}

/// Default splitter: one sub-job carrying the pattern unchanged.
pub struct IdentitySplitter;

impl Splitter for IdentitySplitter {
    fn split(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        vec![pattern.to_vec()]
    }
}

/// Folds sub-job outputs, in completion order, into the job result.
pub trait Aggregator: Send + Sync {
    fn aggregate(&self, outputs: Vec<Vec<u8>>) -> Vec<u8>;
}

/// Default aggregation: concatenation in completion order.
pub struct ConcatAggregator;

impl Aggregator for ConcatAggregator {
    fn aggregate(&self, outputs: Vec<Vec<u8>>) -> Vec<u8> {
        outputs.concat()
    }
}

/// Options for one pattern job.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub fn_id: String,
    /// Job-level bound. `None` uses the distributor default.
    pub task_timeout: Option<Duration>,
    /// Per-sub-job submission options (attempt budget, backoff,
    /// pinning). Distribution and ref mode are forced internally.
    pub submit: SubmitOptions,
}

impl ProcessOptions {
    pub fn new(fn_id: &str) -> Self {
        Self {
            fn_id: fn_id.to_string(),
            task_timeout: None,
            submit: SubmitOptions::default(),
        }
    }
}

/// Returned once every sub-job is placed; the aggregated result arrives
/// later through [`JobReceipt::result`].
pub struct JobReceipt {
    pub job_id: Uuid,
    pub sub_jobs: Vec<TaskHandle>,
    result: oneshot::Receiver<Result<Vec<u8>, TaskError>>,
}

impl JobReceipt {
    pub async fn result(self) -> Result<Vec<u8>, TaskError> {
        self.result
            .await
            .unwrap_or_else(|_| Err(TaskError::TaskFailed("aggregation dropped".into())))
    }
}

pub struct PatternProcessor {
    distributor: Distributor,
    splitter: Arc<dyn Splitter>,
    aggregator: Arc<dyn Aggregator>,
}

impl PatternProcessor {
    pub fn new(distributor: Distributor) -> Self {
        Self {
            distributor,
            splitter: Arc::new(IdentitySplitter),
            aggregator: Arc::new(ConcatAggregator),
        }
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Split, place every sub-job, and return. The aggregated outcome is
    /// delivered through the receipt when the last sub-job terminates.
    pub async fn process(
        &self,
        pattern: &[u8],
        opts: ProcessOptions,
    ) -> Result<JobReceipt, TaskError> {
        let parts = self.splitter.split(pattern);
        if parts.is_empty() {
            return Err(TaskError::InvalidOptions(
                "splitter produced no sub-jobs".into(),
            ));
        }

        let job_id = Uuid::new_v4();
        let timeout = opts
            .task_timeout
            .unwrap_or_else(|| self.distributor.default_task_timeout());

        let mut done_early: Vec<Vec<u8>> = Vec::new();
        let mut pending = Vec::new();
        let mut placed: Vec<TaskHandle> = Vec::new();

        for part in parts {
            let sub_opts = SubmitOptions {
                distributed: true,
                return_ref_mode: true,
                timeout: Some(Duration::MAX),
                ..opts.submit.clone()
            };

            let mut receipt = match self.distributor.submit(part, &opts.fn_id, sub_opts).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    self.cancel_all(&placed).await;
                    return Err(e);
                }
            };
            placed.push(receipt.handle);

            match receipt.wait().await {
                TaskOutcome::Accepted(_) => pending.push(receipt),
                // A very fast sub-job can terminate before its placement
                // ack; its value is already final.
                TaskOutcome::Completed(value) => done_early.push(value),
                TaskOutcome::Failed(e) => {
                    self.cancel_all(&placed).await;
                    return Err(e);
                }
            }
        }

        tracing::info!(
            job = %job_id,
            fn_id = %opts.fn_id,
            sub_jobs = placed.len(),
            "pattern job placed"
        );

        let (tx, rx) = oneshot::channel();
        let distributor = self.distributor.clone();
        let aggregator = Arc::clone(&self.aggregator);
        let sub_jobs = placed.clone();

        tokio::spawn(async move {
            let mut outstanding: HashSet<TaskHandle> =
                pending.iter().map(|r| r.handle).collect();
            let mut outputs = done_early;

            let mut completions: FuturesUnordered<_> = pending
                .into_iter()
                .map(|mut receipt| async move {
                    let outcome = receipt.completed().await;
                    (receipt.handle, outcome)
                })
                .collect();

            let collect = async {
                while let Some((handle, outcome)) = completions.next().await {
                    outstanding.remove(&handle);
                    match outcome {
                        TaskOutcome::Completed(value) => outputs.push(value),
                        TaskOutcome::Failed(e) => return Err(e),
                        TaskOutcome::Accepted(_) => {
                            return Err(TaskError::TaskFailed("duplicate placement ack".into()));
                        }
                    }
                }
                Ok(())
            };

            let result = match tokio::time::timeout(timeout, collect).await {
                Ok(Ok(())) => Ok(aggregator.aggregate(outputs)),
                Ok(Err(e)) => {
                    cancel_outstanding(&distributor, &outstanding).await;
                    Err(e)
                }
                Err(_) => {
                    tracing::warn!(job = %job_id, "pattern job timed out, cancelling sub-jobs");
                    cancel_outstanding(&distributor, &outstanding).await;
                    Err(TaskError::TaskTimedOut)
                }
            };
            let _ = tx.send(result);
        });

        Ok(JobReceipt {
            job_id,
            sub_jobs,
            result: rx,
        })
    }

    async fn cancel_all(&self, handles: &[TaskHandle]) {
        for handle in handles {
            let _ = self.distributor.cancel(*handle).await;
        }
    }
}

async fn cancel_outstanding(distributor: &Distributor, outstanding: &HashSet<TaskHandle>) {
    for handle in outstanding {
        let _ = distributor.cancel(*handle).await;
    }
}

//! Task distributor: the front door for callers.
//!
//! Accepts submissions, places them through the shared placement engine,
//! owns the task table, and resolves each caller continuation exactly
//! once. Terminal records linger for a short grace window so `status`
//! stays answerable, then a purge sweep drops them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use lattice_store::CheckpointStore;

use crate::config::{DistributorConfig, RecoveryConfig};
use crate::error::TaskError;
use crate::node_id::NodeId;
use crate::placement::Placer;
use crate::recovery::{CancelAck, Recovery, TaskUpdate, TrackedTask};
use crate::registry::{FunctionRegistry, WorkerContext};
use crate::snapshot::{self, TaskSnapshot};
use crate::supervision::{RestartIntensity, panic_message, supervise};
use crate::task::{
    CancelStatus, StartWorker, SubmitOptions, TaskHandle, TaskOutcome, TaskStatus, WorkerId,
};

/// How long a terminal record stays queryable before the purge sweep
/// removes it.
const FINISHED_GRACE: Duration = Duration::from_secs(60);
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Timeouts at or above this never fire.
const UNBOUNDED_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

struct TaskRecord {
    fn_id: String,
    status: TaskStatus,
    return_ref_mode: bool,
    assigned_node: Option<NodeId>,
    worker: Option<WorkerId>,
    attempt: u32,
    outcome_tx: Option<oneshot::Sender<TaskOutcome>>,
    completion_tx: Option<oneshot::Sender<TaskOutcome>>,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one task record.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub fn_id: String,
    pub status: TaskStatus,
    pub assigned_node: Option<NodeId>,
    pub worker: Option<WorkerId>,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

enum DistributorMsg {
    Submit {
        input: Vec<u8>,
        fn_id: String,
        opts: SubmitOptions,
        reply: oneshot::Sender<Result<SubmitReceipt, TaskError>>,
    },
    Status {
        handle: TaskHandle,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    Inspect {
        handle: TaskHandle,
        reply: oneshot::Sender<Option<TaskInfo>>,
    },
    Cancel {
        handle: TaskHandle,
        reply: oneshot::Sender<CancelStatus>,
    },
    RecordInline {
        handle: TaskHandle,
        fn_id: String,
        result: Result<(), TaskError>,
        reply: oneshot::Sender<()>,
    },
    Resubmit {
        handle: TaskHandle,
        envelope: TaskSnapshot,
    },
    Update(TaskUpdate),
    PurgeTick,
}

struct Deps {
    local: NodeId,
    registry: Arc<FunctionRegistry>,
    store: Arc<CheckpointStore>,
    placer: Placer,
    recovery: Recovery,
    default_timeout: Duration,
    recovery_defaults: RecoveryConfig,
}

/// Handle to the distributor actor. Cheap to clone; safe to use from any
/// number of concurrent callers.
#[derive(Clone)]
pub struct Distributor {
    tx: mpsc::Sender<DistributorMsg>,
    deps: Arc<Deps>,
}

/// What `submit` hands back: the handle plus the submit future, and --
/// in ref mode -- the separate completion channel.
pub struct SubmitReceipt {
    pub handle: TaskHandle,
    timeout: Duration,
    outcome: Option<oneshot::Receiver<TaskOutcome>>,
    completion: Option<oneshot::Receiver<TaskOutcome>>,
}

impl SubmitReceipt {
    /// Wait for the submit future: the terminal outcome, or the
    /// placement ack in ref mode. Applies the caller-side timeout; on
    /// expiry the task keeps running and the caller sees `TaskTimedOut`.
    pub async fn wait(&mut self) -> TaskOutcome {
        let Some(rx) = self.outcome.take() else {
            return TaskOutcome::Failed(TaskError::InvalidOptions(
                "submit outcome already consumed".into(),
            ));
        };
        await_outcome(self.timeout, rx).await
    }

    /// Wait for the terminal outcome on the completion channel
    /// (ref mode only).
    pub async fn completed(&mut self) -> TaskOutcome {
        let Some(rx) = self.completion.take() else {
            return TaskOutcome::Failed(TaskError::InvalidOptions(
                "no completion channel for this submission".into(),
            ));
        };
        await_outcome(self.timeout, rx).await
    }

    /// Drive the submission to its terminal result, transparently
    /// crossing from the placement ack to the completion channel in
    /// ref mode.
    pub async fn result(mut self) -> Result<Vec<u8>, TaskError> {
        match self.wait().await {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::Accepted(_) => match self.completed().await {
                TaskOutcome::Completed(value) => Ok(value),
                TaskOutcome::Failed(e) => Err(e),
                TaskOutcome::Accepted(_) => {
                    Err(TaskError::TaskFailed("duplicate placement ack".into()))
                }
            },
        }
    }
}

async fn await_outcome(timeout: Duration, rx: oneshot::Receiver<TaskOutcome>) -> TaskOutcome {
    let wait = async {
        rx.await.unwrap_or_else(|_| {
            TaskOutcome::Failed(TaskError::TaskFailed("continuation dropped".into()))
        })
    };

    if timeout >= UNBOUNDED_TIMEOUT {
        wait.await
    } else {
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Failed(TaskError::TaskTimedOut),
        }
    }
}

impl Distributor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        local: NodeId,
        registry: Arc<FunctionRegistry>,
        store: Arc<CheckpointStore>,
        placer: Placer,
        recovery: Recovery,
        updates: mpsc::Receiver<TaskUpdate>,
        config: &DistributorConfig,
        recovery_defaults: RecoveryConfig,
        intensity: RestartIntensity,
    ) -> Self {
        let (tx, rx) = mpsc::channel(512);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let records: Arc<Mutex<HashMap<TaskHandle, TaskRecord>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let deps = Arc::new(Deps {
            local,
            registry,
            store,
            placer,
            recovery,
            default_timeout: config.default_task_timeout(),
            recovery_defaults,
        });

        // Fold recovery updates into the single inbox.
        let update_tx = tx.clone();
        let mut updates = updates;
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if update_tx
                    .send(DistributorMsg::Update(update))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let purge_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if purge_tx.send(DistributorMsg::PurgeTick).await.is_err() {
                    return;
                }
            }
        });

        let actor_deps = Arc::clone(&deps);
        supervise("distributor", intensity, move |_generation| {
            let rx = Arc::clone(&rx);
            let records = Arc::clone(&records);
            let deps = Arc::clone(&actor_deps);
            tokio::spawn(run(rx, records, deps))
        });

        Self { tx, deps }
    }

    /// Submit work for execution.
    ///
    /// Caller errors (`UnknownFunction`, `InvalidOptions`, `NoSuchNode`,
    /// `NoAvailableNode`) surface as an immediate `Err`; everything else
    /// arrives through the receipt.
    pub async fn submit(
        &self,
        input: Vec<u8>,
        fn_id: &str,
        opts: SubmitOptions,
    ) -> Result<SubmitReceipt, TaskError> {
        opts.validate()?;

        if !opts.distributed {
            return self.submit_inline(input, fn_id, &opts).await;
        }

        let (reply, response) = oneshot::channel();
        self.tx
            .send(DistributorMsg::Submit {
                input,
                fn_id: fn_id.to_string(),
                opts,
                reply,
            })
            .await
            .map_err(|_| TaskError::RemoteUnreachable(self.deps.local.clone()))?;
        response
            .await
            .map_err(|_| TaskError::RemoteUnreachable(self.deps.local.clone()))?
    }

    /// Non-blocking status probe. `None` means the handle is unknown
    /// (never submitted, or already purged).
    pub async fn status(&self, handle: TaskHandle) -> Option<TaskStatus> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(DistributorMsg::Status { handle, reply })
            .await
            .ok()?;
        response.await.unwrap_or(None)
    }

    /// Full record view for a handle, while the record is retained.
    pub async fn inspect(&self, handle: TaskHandle) -> Option<TaskInfo> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(DistributorMsg::Inspect { handle, reply })
            .await
            .ok()?;
        response.await.unwrap_or(None)
    }

    /// Best-effort cancellation.
    pub async fn cancel(&self, handle: TaskHandle) -> CancelStatus {
        let (reply, response) = oneshot::channel();
        if self
            .tx
            .send(DistributorMsg::Cancel { handle, reply })
            .await
            .is_err()
        {
            return CancelStatus::NotFound;
        }
        response.await.unwrap_or(CancelStatus::NotFound)
    }

    /// Explicit membership hint: mark a node up and route its lifecycle
    /// events into this node's recovery monitor.
    pub async fn register_worker_node(&self, node: NodeId) -> Result<(), TaskError> {
        self.deps.placer.discovery.register(node.clone()).await;
        if node != self.deps.local {
            self.deps
                .placer
                .transport
                .subscribe_lifecycle(&node, self.deps.recovery.lifecycle_sink())
                .await
                .map_err(|e| e.into_task_error())?;
        }
        Ok(())
    }

    /// Re-submit every decodable envelope left in a durable store.
    /// Fire-and-forget: the original callers are gone, so recovered
    /// tasks run without continuations.
    pub async fn recover_from_store(&self) {
        if !self.deps.store.is_durable() {
            return;
        }

        let mut recovered = 0usize;
        for uuid in self.deps.store.handles() {
            let handle = TaskHandle::from_uuid(uuid);
            if let Some(envelope) = snapshot::read_envelope(&self.deps.store, handle) {
                recovered += 1;
                let _ = self
                    .tx
                    .send(DistributorMsg::Resubmit { handle, envelope })
                    .await;
            }
        }

        if recovered > 0 {
            tracing::info!(tasks = recovered, "recovered in-flight tasks from checkpoints");
        }
    }

    /// The configured default caller-side timeout.
    pub fn default_task_timeout(&self) -> Duration {
        self.deps.default_timeout
    }

    async fn submit_inline(
        &self,
        input: Vec<u8>,
        fn_id: &str,
        opts: &SubmitOptions,
    ) -> Result<SubmitReceipt, TaskError> {
        let function = self
            .deps
            .registry
            .get(fn_id)
            .ok_or_else(|| TaskError::UnknownFunction(fn_id.to_string()))?;

        let handle = TaskHandle::mint();
        let ctx = WorkerContext::local(handle, 1, None, Arc::clone(&self.deps.store));
        let join = tokio::spawn(async move { function.run(input, ctx).await });

        let result = match join.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(TaskError::TaskFailed(msg)),
            Err(e) if e.is_panic() => Err(TaskError::TaskFailed(panic_message(e))),
            Err(_) => Err(TaskError::TaskFailed("inline worker cancelled".into())),
        };

        // Record the terminal state so status stays queryable.
        let (reply, ack) = oneshot::channel();
        let _ = self
            .tx
            .send(DistributorMsg::RecordInline {
                handle,
                fn_id: fn_id.to_string(),
                result: result.as_ref().map(|_| ()).map_err(Clone::clone),
                reply,
            })
            .await;
        let _ = ack.await;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let _ = outcome_tx.send(match result {
            Ok(value) => TaskOutcome::Completed(value),
            Err(e) => TaskOutcome::Failed(e),
        });

        Ok(SubmitReceipt {
            handle,
            timeout: opts.timeout.unwrap_or(self.deps.default_timeout),
            outcome: Some(outcome_rx),
            completion: None,
        })
    }
}

async fn run(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DistributorMsg>>>,
    records: Arc<Mutex<HashMap<TaskHandle, TaskRecord>>>,
    deps: Arc<Deps>,
) {
    loop {
        let msg = { rx.lock().await.recv().await };
        let Some(msg) = msg else { return };

        match msg {
            DistributorMsg::Submit {
                input,
                fn_id,
                opts,
                reply,
            } => {
                let _ = reply.send(handle_submit(&records, &deps, input, fn_id, opts).await);
            }

            DistributorMsg::Status { handle, reply } => {
                let status = lock(&records).get(&handle).map(|r| r.status);
                let _ = reply.send(status);
            }

            DistributorMsg::Inspect { handle, reply } => {
                let info = lock(&records).get(&handle).map(|record| TaskInfo {
                    handle,
                    fn_id: record.fn_id.clone(),
                    status: record.status,
                    assigned_node: record.assigned_node.clone(),
                    worker: record.worker,
                    attempt: record.attempt,
                    submitted_at: record.submitted_at,
                    started_at: record.started_at,
                    finished_at: record.finished_at,
                });
                let _ = reply.send(info);
            }

            DistributorMsg::Cancel { handle, reply } => {
                enum Verdict {
                    NotFound,
                    AlreadyTerminal,
                    Forward,
                }
                let verdict = match lock(&records).get(&handle) {
                    None => Verdict::NotFound,
                    Some(record) if record.status.is_terminal() => Verdict::AlreadyTerminal,
                    Some(_) => Verdict::Forward,
                };

                match verdict {
                    Verdict::NotFound => {
                        let _ = reply.send(CancelStatus::NotFound);
                    }
                    Verdict::AlreadyTerminal => {
                        let _ = reply.send(CancelStatus::AlreadyTerminal);
                    }
                    Verdict::Forward => {
                        // Resolve off-actor so a slow acknowledgement
                        // cannot stall other callers.
                        let recovery = deps.recovery.clone();
                        tokio::spawn(async move {
                            let ack = recovery.cancel(handle).await;
                            let status = match ack {
                                CancelAck::Accepted | CancelAck::Finished => CancelStatus::Ok,
                                CancelAck::Unknown => CancelStatus::AlreadyTerminal,
                            };
                            let _ = reply.send(status);
                        });
                    }
                }
            }

            DistributorMsg::RecordInline {
                handle,
                fn_id,
                result,
                reply,
            } => {
                let now = Utc::now();
                lock(&records).insert(
                    handle,
                    TaskRecord {
                        fn_id,
                        status: match result {
                            Ok(()) => TaskStatus::Completed,
                            Err(_) => TaskStatus::Failed,
                        },
                        return_ref_mode: false,
                        assigned_node: Some(deps.local.clone()),
                        worker: None,
                        attempt: 1,
                        outcome_tx: None,
                        completion_tx: None,
                        submitted_at: now,
                        started_at: Some(now),
                        finished_at: Some(now),
                    },
                );
                let _ = reply.send(());
            }

            DistributorMsg::Resubmit { handle, envelope } => {
                lock(&records).insert(
                    handle,
                    TaskRecord {
                        fn_id: envelope.fn_id.clone(),
                        status: TaskStatus::Pending,
                        return_ref_mode: false,
                        assigned_node: None,
                        worker: None,
                        attempt: envelope.attempt,
                        outcome_tx: None,
                        completion_tx: None,
                        submitted_at: Utc::now(),
                        started_at: None,
                        finished_at: None,
                    },
                );

                deps.recovery
                    .track(TrackedTask {
                        handle,
                        fn_id: envelope.fn_id.clone(),
                        input: envelope.input.clone(),
                        attempt: envelope.attempt,
                        max_attempts: envelope.max_attempts,
                        initial_backoff_ms: deps.recovery_defaults.initial_backoff_ms,
                        max_backoff_ms: deps.recovery_defaults.max_backoff_ms,
                    })
                    .await;
                deps.recovery.dispatch(
                    deps.placer.clone(),
                    StartWorker {
                        owner: deps.local.clone(),
                        handle,
                        fn_id: envelope.fn_id,
                        input: envelope.input,
                        attempt: envelope.attempt,
                        checkpoint: envelope.progress,
                    },
                    None,
                );
            }

            DistributorMsg::Update(update) => {
                handle_update(&records, &deps, update).await;
            }

            DistributorMsg::PurgeTick => {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(FINISHED_GRACE)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                lock(&records).retain(|_, record| {
                    !(record.status.is_terminal()
                        && record.finished_at.is_some_and(|t| t < cutoff))
                });
            }
        }
    }
}

async fn handle_submit(
    records: &Arc<Mutex<HashMap<TaskHandle, TaskRecord>>>,
    deps: &Arc<Deps>,
    input: Vec<u8>,
    fn_id: String,
    opts: SubmitOptions,
) -> Result<SubmitReceipt, TaskError> {
    if !deps.registry.contains(&fn_id) {
        return Err(TaskError::UnknownFunction(fn_id));
    }

    // Placement preconditions are caller errors and surface immediately.
    let up = deps.placer.discovery.list_up().await;
    if let Some(target) = &opts.target_node {
        if !up.contains(target) {
            return Err(TaskError::NoSuchNode(target.clone()));
        }
    } else if up.is_empty() {
        return Err(TaskError::NoAvailableNode);
    }

    let handle = TaskHandle::mint();
    let max_attempts = opts
        .max_attempts
        .unwrap_or(deps.recovery_defaults.max_attempts);
    let initial_backoff_ms = opts
        .initial_backoff_ms
        .unwrap_or(deps.recovery_defaults.initial_backoff_ms);
    let max_backoff_ms = opts
        .max_backoff_ms
        .unwrap_or(deps.recovery_defaults.max_backoff_ms);

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (completion_tx, completion_rx) = if opts.return_ref_mode {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    lock(records).insert(
        handle,
        TaskRecord {
            fn_id: fn_id.clone(),
            status: TaskStatus::Pending,
            return_ref_mode: opts.return_ref_mode,
            assigned_node: None,
            worker: None,
            attempt: 1,
            outcome_tx: Some(outcome_tx),
            completion_tx,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        },
    );

    tracing::info!(
        handle = %handle,
        fn_id = %fn_id,
        max_attempts,
        target = opts.target_node.as_ref().map(|n| n.as_str()).unwrap_or("-"),
        "task submitted"
    );

    snapshot::write_envelope(
        &deps.store,
        handle,
        &TaskSnapshot {
            fn_id: fn_id.clone(),
            input: input.clone(),
            attempt: 1,
            max_attempts,
            progress: None,
        },
    );

    deps.recovery
        .track(TrackedTask {
            handle,
            fn_id: fn_id.clone(),
            input: input.clone(),
            attempt: 1,
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        })
        .await;
    deps.recovery.dispatch(
        deps.placer.clone(),
        StartWorker {
            owner: deps.local.clone(),
            handle,
            fn_id,
            input,
            attempt: 1,
            checkpoint: None,
        },
        opts.target_node.clone(),
    );

    Ok(SubmitReceipt {
        handle,
        timeout: opts.timeout.unwrap_or(deps.default_timeout),
        outcome: Some(outcome_rx),
        completion: completion_rx,
    })
}

async fn handle_update(
    records: &Arc<Mutex<HashMap<TaskHandle, TaskRecord>>>,
    deps: &Arc<Deps>,
    update: TaskUpdate,
) {
    match update {
        TaskUpdate::Placed {
            handle,
            attempt,
            node,
            worker,
        } => {
            let ack = {
                let mut guard = lock(records);
                let Some(record) = guard.get_mut(&handle) else {
                    return;
                };
                record.assigned_node = Some(node);
                record.worker = Some(worker);
                record.attempt = attempt;
                if record.return_ref_mode {
                    record.outcome_tx.take()
                } else {
                    None
                }
            };

            if let Some(tx) = ack {
                let _ = tx.send(TaskOutcome::Accepted(handle));
            }
        }

        TaskUpdate::Running { handle, attempt } => {
            let mut guard = lock(records);
            if let Some(record) = guard.get_mut(&handle) {
                if !record.status.is_terminal() {
                    record.status = TaskStatus::Running;
                    record.attempt = attempt;
                    record.started_at.get_or_insert_with(Utc::now);
                }
            }
        }

        TaskUpdate::Retrying { handle, attempt } => {
            let mut guard = lock(records);
            if let Some(record) = guard.get_mut(&handle) {
                if !record.status.is_terminal() {
                    record.status = TaskStatus::Pending;
                    record.attempt = attempt;
                    record.worker = None;
                }
            }
        }

        TaskUpdate::Finalized { handle, result } => {
            let resolved = {
                let mut guard = lock(records);
                let Some(record) = guard.get_mut(&handle) else {
                    return;
                };
                if record.status.is_terminal() {
                    return;
                }
                record.status = match &result {
                    Ok(_) => TaskStatus::Completed,
                    Err(TaskError::TaskCancelled) => TaskStatus::Cancelled,
                    Err(_) => TaskStatus::Failed,
                };
                record.finished_at = Some(Utc::now());
                record.worker = None;
                record
                    .outcome_tx
                    .take()
                    .or_else(|| record.completion_tx.take())
            };

            tracing::info!(
                handle = %handle,
                outcome = %match &result {
                    Ok(_) => "completed".to_string(),
                    Err(e) => e.to_string(),
                },
                "task finalized"
            );

            // Terminal transition drops the checkpoint entry.
            match deps.store.delete(handle.as_uuid()) {
                Ok(()) => {}
                Err(lattice_store::StoreError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(handle = %handle, error = %e, "failed to drop checkpoint");
                }
            }

            if let Some(tx) = resolved {
                let outcome = match result {
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(e) => TaskOutcome::Failed(e),
                };
                let _ = tx.send(outcome);
            }
        }
    }
}

fn lock<'a>(
    records: &'a Arc<Mutex<HashMap<TaskHandle, TaskRecord>>>,
) -> std::sync::MutexGuard<'a, HashMap<TaskHandle, TaskRecord>> {
    records.lock().unwrap_or_else(|e| e.into_inner())
}

//! Task recovery monitor: drives the retry policy over worker lifecycle
//! events.
//!
//! Per-task state machine:
//!
//! ```text
//! Placing  ──(placed)──▶ Starting ──(Started)──▶ Running
//! Running  ──(Exited normal)──▶ done
//! Running  ──(Exited abnormal, k < N)──▶ Backoff ──(timer)──▶ Placing (k+1)
//! Running  ──(Exited abnormal, k ≥ N)──▶ failed
//! any      ──(cancel)──▶ Cancelling ──(Exited *)──▶ cancelled
//! ```
//!
//! Backoff doubles per retry up to the cap. Terminal decisions flow to
//! the distributor, which owns the task table and the caller
//! continuations; this actor owns only the retry view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use lattice_store::CheckpointStore;

use crate::discovery::MembershipEvent;
use crate::error::TaskError;
use crate::node_id::NodeId;
use crate::placement::Placer;
use crate::snapshot;
use crate::supervision::{RestartIntensity, supervise};
use crate::task::{
    ExitReason, ExitStatus, LifecycleEvent, LifecycleKind, StartWorker, TaskHandle, WorkerId,
};

/// Updates pushed to the distributor, the task table's single writer.
#[derive(Debug)]
pub(crate) enum TaskUpdate {
    Placed {
        handle: TaskHandle,
        attempt: u32,
        node: NodeId,
        worker: WorkerId,
    },
    Running {
        handle: TaskHandle,
        attempt: u32,
    },
    /// A retry is scheduled; the task is pending again at `attempt`.
    Retrying {
        handle: TaskHandle,
        attempt: u32,
    },
    Finalized {
        handle: TaskHandle,
        result: Result<Vec<u8>, TaskError>,
    },
}

/// What the distributor registers per dispatched task.
#[derive(Debug, Clone)]
pub(crate) struct TrackedTask {
    pub handle: TaskHandle,
    pub fn_id: String,
    pub input: Vec<u8>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Reply to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelAck {
    /// Cancellation is under way; the task will finalize as cancelled.
    Accepted,
    /// The task was cancelled on the spot (it was between attempts).
    Finished,
    /// Nothing tracked under that handle.
    Unknown,
}

enum Phase {
    /// Placement in flight for the current attempt.
    Placing,
    /// A supervisor accepted the start; awaiting its Started event.
    Starting { node: NodeId, worker: WorkerId },
    Running { node: NodeId, worker: WorkerId },
    /// Waiting out the delay before the next attempt.
    Backoff { timer: AbortHandle },
    /// Cancel requested; waiting for the worker's exit event.
    Cancelling { node: NodeId, worker: WorkerId },
    /// Cancel requested while placement was still in flight.
    CancellingPlacement,
}

struct TaskState {
    fn_id: String,
    input: Vec<u8>,
    attempt: u32,
    max_attempts: u32,
    backoff_ms: u64,
    max_backoff_ms: u64,
    phase: Phase,
}

enum RecoveryMsg {
    Track {
        task: TrackedTask,
    },
    Placed {
        handle: TaskHandle,
        attempt: u32,
        node: NodeId,
        worker: WorkerId,
    },
    PlaceFailed {
        handle: TaskHandle,
        attempt: u32,
        error: TaskError,
    },
    RetryNow {
        handle: TaskHandle,
        attempt: u32,
    },
    Cancel {
        handle: TaskHandle,
        reply: oneshot::Sender<CancelAck>,
    },
    Lifecycle(LifecycleEvent),
    Membership(MembershipEvent),
}

struct Deps {
    placer: Placer,
    store: Arc<CheckpointStore>,
    updates: mpsc::Sender<TaskUpdate>,
    self_tx: mpsc::Sender<RecoveryMsg>,
}

/// Handle to the recovery actor. Cheap to clone.
#[derive(Clone)]
pub struct Recovery {
    tx: mpsc::Sender<RecoveryMsg>,
}

impl Recovery {
    pub(crate) fn spawn(
        placer: Placer,
        store: Arc<CheckpointStore>,
        updates: mpsc::Sender<TaskUpdate>,
        intensity: RestartIntensity,
    ) -> Self {
        let (tx, rx) = mpsc::channel(512);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let state: Arc<Mutex<HashMap<TaskHandle, TaskState>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let deps = Arc::new(Deps {
            placer,
            store,
            updates,
            self_tx: tx.clone(),
        });

        supervise("recovery", intensity, move |_generation| {
            let rx = Arc::clone(&rx);
            let state = Arc::clone(&state);
            let deps = Arc::clone(&deps);
            tokio::spawn(run(rx, state, deps))
        });

        Self { tx }
    }

    /// Register a task before its first dispatch. The inbox is FIFO, so
    /// tracking lands before any placement or lifecycle message for the
    /// same handle.
    pub(crate) async fn track(&self, task: TrackedTask) {
        let _ = self.tx.send(RecoveryMsg::Track { task }).await;
    }

    /// Kick off placement for the task's current attempt.
    pub(crate) fn dispatch(&self, placer: Placer, req: StartWorker, target: Option<NodeId>) {
        spawn_placement(placer, self.tx.clone(), req, target);
    }

    pub(crate) async fn cancel(&self, handle: TaskHandle) -> CancelAck {
        let (reply, response) = oneshot::channel();
        if self
            .tx
            .send(RecoveryMsg::Cancel { handle, reply })
            .await
            .is_err()
        {
            return CancelAck::Unknown;
        }
        response.await.unwrap_or(CancelAck::Unknown)
    }

    /// A sender that feeds worker lifecycle events into the actor.
    /// Hand it to supervisors, locally or over the transport.
    pub fn lifecycle_sink(&self) -> mpsc::Sender<LifecycleEvent> {
        let (sink, mut rx) = mpsc::channel::<LifecycleEvent>(256);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(RecoveryMsg::Lifecycle(event)).await.is_err() {
                    return;
                }
            }
        });
        sink
    }

    /// A sender that feeds membership events into the actor.
    pub fn membership_sink(&self) -> mpsc::Sender<MembershipEvent> {
        let (sink, mut rx) = mpsc::channel::<MembershipEvent>(64);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(RecoveryMsg::Membership(event)).await.is_err() {
                    return;
                }
            }
        });
        sink
    }
}

fn spawn_placement(
    placer: Placer,
    tx: mpsc::Sender<RecoveryMsg>,
    req: StartWorker,
    target: Option<NodeId>,
) {
    tokio::spawn(async move {
        let handle = req.handle;
        let attempt = req.attempt;
        let msg = match placer.place(req, target.as_ref()).await {
            Ok((node, worker)) => RecoveryMsg::Placed {
                handle,
                attempt,
                node,
                worker,
            },
            Err(error) => RecoveryMsg::PlaceFailed {
                handle,
                attempt,
                error,
            },
        };
        let _ = tx.send(msg).await;
    });
}

async fn run(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RecoveryMsg>>>,
    state: Arc<Mutex<HashMap<TaskHandle, TaskState>>>,
    deps: Arc<Deps>,
) {
    loop {
        let msg = { rx.lock().await.recv().await };
        let Some(msg) = msg else { return };

        match msg {
            RecoveryMsg::Track { task } => {
                lock(&state).insert(
                    task.handle,
                    TaskState {
                        fn_id: task.fn_id,
                        input: task.input,
                        attempt: task.attempt,
                        max_attempts: task.max_attempts,
                        backoff_ms: task.initial_backoff_ms,
                        max_backoff_ms: task.max_backoff_ms,
                        phase: Phase::Placing,
                    },
                );
            }

            RecoveryMsg::Placed {
                handle,
                attempt,
                node,
                worker,
            } => {
                enum Action {
                    Orphan,
                    CancelNow,
                    Confirm,
                }
                let action = {
                    let mut guard = lock(&state);
                    match guard.get_mut(&handle) {
                        None => Action::Orphan,
                        Some(task) if task.attempt != attempt => Action::Orphan,
                        Some(task) => match task.phase {
                            Phase::CancellingPlacement => {
                                task.phase = Phase::Cancelling {
                                    node: node.clone(),
                                    worker,
                                };
                                Action::CancelNow
                            }
                            Phase::Placing => {
                                task.phase = Phase::Starting {
                                    node: node.clone(),
                                    worker,
                                };
                                Action::Confirm
                            }
                            // The Started event can outrun this message;
                            // keep the later phase, record the placement.
                            Phase::Starting { .. } | Phase::Running { .. } => Action::Confirm,
                            Phase::Backoff { .. } | Phase::Cancelling { .. } => Action::Orphan,
                        },
                    }
                };

                match action {
                    Action::Orphan => {
                        // The task finalized while placement was in
                        // flight; reap the stray worker.
                        spawn_worker_cancel(&deps, node, worker, handle, attempt);
                    }
                    Action::CancelNow => {
                        spawn_worker_cancel(&deps, node, worker, handle, attempt);
                    }
                    Action::Confirm => {
                        send_update(
                            &deps,
                            TaskUpdate::Placed {
                                handle,
                                attempt,
                                node,
                                worker,
                            },
                        )
                        .await;
                    }
                }
            }

            RecoveryMsg::PlaceFailed {
                handle,
                attempt,
                error,
            } => {
                let cancelling = {
                    let guard = lock(&state);
                    match guard.get(&handle) {
                        None => continue,
                        Some(task) if task.attempt != attempt => continue,
                        Some(task) => matches!(
                            task.phase,
                            Phase::CancellingPlacement | Phase::Cancelling { .. }
                        ),
                    }
                };

                if cancelling {
                    finalize(&state, &deps, handle, Err(TaskError::TaskCancelled)).await;
                } else if error.retryable() {
                    retry_or_fail(&state, &deps, handle, ExitReason::Placement(error.to_string()))
                        .await;
                } else {
                    finalize(&state, &deps, handle, Err(error)).await;
                }
            }

            RecoveryMsg::RetryNow { handle, attempt } => {
                let req = {
                    let mut guard = lock(&state);
                    match guard.get_mut(&handle) {
                        None => continue,
                        Some(task) if task.attempt != attempt => continue,
                        Some(task) => {
                            if !matches!(task.phase, Phase::Backoff { .. }) {
                                continue;
                            }
                            task.phase = Phase::Placing;
                            StartWorker {
                                owner: deps.placer.local.clone(),
                                handle,
                                fn_id: task.fn_id.clone(),
                                input: task.input.clone(),
                                attempt,
                                checkpoint: None,
                            }
                        }
                    }
                };

                // Resume from the latest checkpoint and keep the stored
                // envelope's attempt counter current.
                let mut req = req;
                if let Some(mut envelope) = snapshot::read_envelope(&deps.store, handle) {
                    req.checkpoint = envelope.progress.clone();
                    envelope.attempt = attempt;
                    snapshot::write_envelope(&deps.store, handle, &envelope);
                }

                tracing::info!(
                    handle = %handle,
                    attempt,
                    "starting retry attempt"
                );
                spawn_placement(deps.placer.clone(), deps.self_tx.clone(), req, None);
            }

            RecoveryMsg::Cancel { handle, reply } => {
                enum Action {
                    None,
                    FinalizeNow,
                    StopWorker(NodeId, WorkerId, u32),
                }
                let (ack, action) = {
                    let mut guard = lock(&state);
                    match guard.get_mut(&handle) {
                        None => (CancelAck::Unknown, Action::None),
                        Some(task) => match &task.phase {
                            Phase::Backoff { timer } => {
                                timer.abort();
                                (CancelAck::Finished, Action::FinalizeNow)
                            }
                            Phase::Placing => {
                                task.phase = Phase::CancellingPlacement;
                                (CancelAck::Accepted, Action::None)
                            }
                            Phase::Starting { node, worker } | Phase::Running { node, worker } => {
                                let (node, worker) = (node.clone(), *worker);
                                let attempt = task.attempt;
                                task.phase = Phase::Cancelling {
                                    node: node.clone(),
                                    worker,
                                };
                                (CancelAck::Accepted, Action::StopWorker(node, worker, attempt))
                            }
                            Phase::Cancelling { .. } | Phase::CancellingPlacement => {
                                (CancelAck::Accepted, Action::None)
                            }
                        },
                    }
                };

                match action {
                    Action::None => {}
                    Action::FinalizeNow => {
                        finalize(&state, &deps, handle, Err(TaskError::TaskCancelled)).await;
                    }
                    Action::StopWorker(node, worker, attempt) => {
                        spawn_worker_cancel(&deps, node, worker, handle, attempt);
                    }
                }
                let _ = reply.send(ack);
            }

            RecoveryMsg::Lifecycle(event) => {
                handle_lifecycle(&state, &deps, event).await;
            }

            RecoveryMsg::Membership(event) => {
                if let MembershipEvent::Down { node, .. } = event {
                    handle_node_down(&state, &deps, node).await;
                }
            }
        }
    }
}

async fn handle_lifecycle(
    state: &Arc<Mutex<HashMap<TaskHandle, TaskState>>>,
    deps: &Arc<Deps>,
    event: LifecycleEvent,
) {
    match event.kind {
        LifecycleKind::Started => {
            let confirmed = {
                let mut guard = lock(state);
                match guard.get_mut(&event.handle) {
                    Some(task)
                        if task.attempt == event.attempt
                            && matches!(task.phase, Phase::Starting { .. } | Phase::Placing) =>
                    {
                        task.phase = Phase::Running {
                            node: event.node.clone(),
                            worker: event.worker,
                        };
                        true
                    }
                    _ => false,
                }
            };

            if confirmed {
                send_update(
                    deps,
                    TaskUpdate::Running {
                        handle: event.handle,
                        attempt: event.attempt,
                    },
                )
                .await;
            }
        }

        LifecycleKind::Exited(status) => {
            enum Outcome {
                Ignore,
                Cancelled,
                Done(Vec<u8>),
                Retry(ExitReason),
            }
            let outcome = {
                let guard = lock(state);
                match guard.get(&event.handle) {
                    None => Outcome::Ignore,
                    Some(task) if task.attempt != event.attempt => Outcome::Ignore,
                    Some(task) => match (&task.phase, status) {
                        (Phase::Cancelling { .. } | Phase::CancellingPlacement, _) => {
                            Outcome::Cancelled
                        }
                        (_, ExitStatus::Normal(value)) => Outcome::Done(value),
                        (_, ExitStatus::Abnormal(reason)) => Outcome::Retry(reason),
                    },
                }
            };

            match outcome {
                Outcome::Ignore => {
                    tracing::debug!(
                        handle = %event.handle,
                        attempt = event.attempt,
                        "ignoring stale lifecycle event"
                    );
                }
                Outcome::Cancelled => {
                    finalize(state, deps, event.handle, Err(TaskError::TaskCancelled)).await;
                }
                Outcome::Done(value) => {
                    finalize(state, deps, event.handle, Ok(value)).await;
                }
                Outcome::Retry(reason) => {
                    retry_or_fail(state, deps, event.handle, reason).await;
                }
            }
        }
    }
}

async fn handle_node_down(
    state: &Arc<Mutex<HashMap<TaskHandle, TaskState>>>,
    deps: &Arc<Deps>,
    down: NodeId,
) {
    enum Hit {
        Active(TaskHandle),
        Cancelling(TaskHandle),
    }
    let hits: Vec<Hit> = {
        let guard = lock(state);
        guard
            .iter()
            .filter_map(|(handle, task)| match &task.phase {
                Phase::Starting { node, .. } | Phase::Running { node, .. } if *node == down => {
                    Some(Hit::Active(*handle))
                }
                Phase::Cancelling { node, .. } if *node == down => Some(Hit::Cancelling(*handle)),
                _ => None,
            })
            .collect()
    };

    for hit in hits {
        match hit {
            Hit::Active(handle) => {
                tracing::warn!(
                    handle = %handle,
                    node = %down,
                    "assigned node went down mid-execution"
                );
                retry_or_fail(state, deps, handle, ExitReason::NodeDown(down.clone())).await;
            }
            Hit::Cancelling(handle) => {
                finalize(state, deps, handle, Err(TaskError::TaskCancelled)).await;
            }
        }
    }
}

/// Apply the retry algorithm to one abnormal exit.
async fn retry_or_fail(
    state: &Arc<Mutex<HashMap<TaskHandle, TaskState>>>,
    deps: &Arc<Deps>,
    handle: TaskHandle,
    reason: ExitReason,
) {
    if !reason.retryable() {
        let error = match reason {
            ExitReason::Cancelled => TaskError::TaskCancelled,
            ExitReason::UnknownFunction(name) => TaskError::UnknownFunction(name),
            other => TaskError::TaskFailed(other.to_string()),
        };
        finalize(state, deps, handle, Err(error)).await;
        return;
    }

    enum Decision {
        Exhausted { attempts: u32, last_reason: String },
        Backoff { delay_ms: u64, next_attempt: u32 },
    }
    let decision = {
        let mut guard = lock(state);
        let Some(task) = guard.get_mut(&handle) else {
            return;
        };

        if task.attempt >= task.max_attempts {
            Decision::Exhausted {
                attempts: task.attempt,
                last_reason: reason.to_string(),
            }
        } else {
            let delay_ms = task.backoff_ms;
            task.backoff_ms = (task.backoff_ms.saturating_mul(2)).min(task.max_backoff_ms);
            task.attempt += 1;
            let next_attempt = task.attempt;

            let self_tx = deps.self_tx.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = self_tx
                    .send(RecoveryMsg::RetryNow {
                        handle,
                        attempt: next_attempt,
                    })
                    .await;
            });
            task.phase = Phase::Backoff {
                timer: timer.abort_handle(),
            };
            Decision::Backoff {
                delay_ms,
                next_attempt,
            }
        }
    };

    match decision {
        Decision::Exhausted {
            attempts,
            last_reason,
        } => {
            tracing::error!(
                handle = %handle,
                attempts,
                reason = %last_reason,
                "Task failed after {attempts} attempts"
            );
            finalize(state, deps, handle, Err(TaskError::TaskFailed(last_reason))).await;
        }
        Decision::Backoff {
            delay_ms,
            next_attempt,
        } => {
            tracing::info!(
                handle = %handle,
                reason = %reason,
                delay_ms,
                next_attempt,
                "worker failed, retrying after backoff"
            );
            send_update(
                deps,
                TaskUpdate::Retrying {
                    handle,
                    attempt: next_attempt,
                },
            )
            .await;
        }
    }
}

/// Remove the retry state and hand the terminal outcome to the
/// distributor.
async fn finalize(
    state: &Arc<Mutex<HashMap<TaskHandle, TaskState>>>,
    deps: &Arc<Deps>,
    handle: TaskHandle,
    result: Result<Vec<u8>, TaskError>,
) {
    let removed = {
        let mut guard = lock(state);
        guard.remove(&handle)
    };
    if let Some(task) = removed {
        if let Phase::Backoff { timer } = task.phase {
            timer.abort();
        }
        send_update(deps, TaskUpdate::Finalized { handle, result }).await;
    }
}

/// Ask a supervisor to stop a worker. If the request cannot be
/// delivered, synthesize the exit locally so cancellation still
/// terminates promptly.
fn spawn_worker_cancel(
    deps: &Arc<Deps>,
    node: NodeId,
    worker: WorkerId,
    handle: TaskHandle,
    attempt: u32,
) {
    let transport = Arc::clone(&deps.placer.transport);
    let self_tx = deps.self_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = transport.cancel_worker(&node, worker).await {
            tracing::debug!(
                node = %node,
                worker = %worker,
                error = %e,
                "worker cancel did not reach the node"
            );
            let _ = self_tx
                .send(RecoveryMsg::Lifecycle(LifecycleEvent {
                    node,
                    worker,
                    handle,
                    attempt,
                    kind: LifecycleKind::Exited(ExitStatus::Abnormal(ExitReason::Cancelled)),
                    at: chrono::Utc::now(),
                }))
                .await;
        }
    });
}

async fn send_update(deps: &Arc<Deps>, update: TaskUpdate) {
    if deps.updates.send(update).await.is_err() {
        tracing::debug!("distributor inbox closed, dropping task update");
    }
}

fn lock<'a>(
    state: &'a Arc<Mutex<HashMap<TaskHandle, TaskState>>>,
) -> std::sync::MutexGuard<'a, HashMap<TaskHandle, TaskState>> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

//! Worker supervisor: owns every live worker on its node.
//!
//! Each worker attempt runs in a spawned wrapper that always produces
//! exactly one terminal lifecycle event -- a returned value, a function
//! error, a caught panic, a cancellation, or an unknown function (which
//! invokes nothing). Stops are cooperative first and escalate to an
//! abort after the shutdown window. After a supervisor restart, every
//! previously known worker exits as `supervisor_restart` before new work
//! is accepted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use lattice_store::CheckpointStore;

use crate::config::SupervisorConfig;
use crate::error::TaskError;
use crate::node_id::NodeId;
use crate::registry::{FunctionRegistry, WorkerContext};
use crate::supervision::{RestartIntensity, panic_message, supervise};
use crate::task::{
    ExitReason, ExitStatus, LifecycleEvent, LifecycleKind, StartWorker, TaskHandle, WorkerId,
};
use crate::transport::Transport;

enum SupervisorMsg {
    Start {
        req: StartWorker,
        reply: oneshot::Sender<Result<WorkerId, TaskError>>,
    },
    Stop {
        worker: WorkerId,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        sink: mpsc::Sender<LifecycleEvent>,
    },
    WorkerDone {
        worker: WorkerId,
        status: ExitStatus,
    },
    Escalate {
        worker: WorkerId,
    },
    Restart {
        reply: oneshot::Sender<()>,
    },
}

struct WorkerRecord {
    handle: TaskHandle,
    attempt: u32,
    cancel: CancellationToken,
    abort: AbortHandle,
}

struct State {
    workers: HashMap<WorkerId, WorkerRecord>,
    by_attempt: HashMap<(TaskHandle, u32), WorkerId>,
    sinks: Vec<mpsc::Sender<LifecycleEvent>>,
}

struct Deps {
    node: NodeId,
    registry: Arc<FunctionRegistry>,
    store: Arc<CheckpointStore>,
    transport: Arc<dyn Transport>,
    shutdown_window: Duration,
    high_water_mark: usize,
    self_tx: mpsc::Sender<SupervisorMsg>,
}

/// Handle to one node's worker supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<SupervisorMsg>,
    node: NodeId,
}

impl Supervisor {
    pub fn spawn(
        node: NodeId,
        registry: Arc<FunctionRegistry>,
        store: Arc<CheckpointStore>,
        transport: Arc<dyn Transport>,
        config: &SupervisorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let state = Arc::new(Mutex::new(State {
            workers: HashMap::new(),
            by_attempt: HashMap::new(),
            sinks: Vec::new(),
        }));
        let deps = Arc::new(Deps {
            node: node.clone(),
            registry,
            store,
            transport,
            shutdown_window: config.shutdown_window(),
            high_water_mark: config.high_water_mark,
            self_tx: tx.clone(),
        });

        supervise("worker-supervisor", RestartIntensity::from(config), move |generation| {
            let rx = Arc::clone(&rx);
            let state = Arc::clone(&state);
            let deps = Arc::clone(&deps);
            tokio::spawn(run(rx, state, deps, generation))
        });

        Self { tx, node }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Start a worker for one task attempt. Idempotent per
    /// `(handle, attempt)`.
    pub async fn start(&self, req: StartWorker) -> Result<WorkerId, TaskError> {
        let (reply, response) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMsg::Start { req, reply })
            .await
            .is_err()
        {
            return Err(TaskError::RemoteUnreachable(self.node.clone()));
        }
        response
            .await
            .unwrap_or(Err(TaskError::RemoteUnreachable(self.node.clone())))
    }

    /// Request a graceful stop. Returns whether the worker was known.
    pub async fn stop(&self, worker: WorkerId) -> bool {
        let (reply, response) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMsg::Stop { worker, reply })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Register a lifecycle event sink.
    pub async fn subscribe(&self, sink: mpsc::Sender<LifecycleEvent>) {
        let _ = self.tx.send(SupervisorMsg::Subscribe { sink }).await;
    }

    /// Flush the worker table as `supervisor_restart` exits.
    pub async fn restart(&self) {
        let (reply, ack) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMsg::Restart { reply })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }
}

async fn run(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SupervisorMsg>>>,
    state: Arc<Mutex<State>>,
    deps: Arc<Deps>,
    generation: u32,
) {
    // A respawned loop lost track of its workers' progress; flush them
    // before accepting new work.
    if generation > 0 {
        flush_workers(&state, &deps).await;
    }

    loop {
        let msg = { rx.lock().await.recv().await };
        let Some(msg) = msg else { return };

        match msg {
            SupervisorMsg::Start { req, reply } => {
                let _ = reply.send(handle_start(&state, &deps, req).await);
            }
            SupervisorMsg::Stop { worker, reply } => {
                let known = {
                    let guard = lock(&state);
                    if let Some(record) = guard.workers.get(&worker) {
                        record.cancel.cancel();
                        true
                    } else {
                        false
                    }
                };
                if known {
                    let escalate_tx = deps.self_tx.clone();
                    let window = deps.shutdown_window;
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        let _ = escalate_tx.send(SupervisorMsg::Escalate { worker }).await;
                    });
                }
                let _ = reply.send(known);
            }
            SupervisorMsg::Subscribe { sink } => {
                lock(&state).sinks.push(sink);
            }
            SupervisorMsg::WorkerDone { worker, status } => {
                let removed = {
                    let mut guard = lock(&state);
                    let record = guard.workers.remove(&worker);
                    if let Some(record) = &record {
                        guard.by_attempt.remove(&(record.handle, record.attempt));
                    }
                    record
                };
                // Already flushed workers reported their terminal event;
                // a late done must not produce a second one.
                if let Some(record) = removed {
                    tracing::debug!(
                        worker = %worker,
                        handle = %record.handle,
                        attempt = record.attempt,
                        "worker exited"
                    );
                    emit(
                        &state,
                        exit_event(&deps.node, worker, record.handle, record.attempt, status),
                    )
                    .await;
                }
            }
            SupervisorMsg::Escalate { worker } => {
                let guard = lock(&state);
                if let Some(record) = guard.workers.get(&worker) {
                    tracing::warn!(
                        worker = %worker,
                        handle = %record.handle,
                        "worker ignored stop, killing it"
                    );
                    record.abort.abort();
                }
            }
            SupervisorMsg::Restart { reply } => {
                flush_workers(&state, &deps).await;
                let _ = reply.send(());
            }
        }
    }
}

async fn handle_start(
    state: &Arc<Mutex<State>>,
    deps: &Arc<Deps>,
    req: StartWorker,
) -> Result<WorkerId, TaskError> {
    {
        let guard = lock(state);
        if let Some(existing) = guard.by_attempt.get(&(req.handle, req.attempt)) {
            return Ok(*existing);
        }
        if guard.workers.len() >= deps.high_water_mark {
            return Err(TaskError::NodeOverloaded(deps.node.clone()));
        }
    }

    let worker = WorkerId::mint();

    let Some(function) = deps.registry.get(&req.fn_id) else {
        emit(
            state,
            exit_event(
                &deps.node,
                worker,
                req.handle,
                req.attempt,
                ExitStatus::Abnormal(ExitReason::UnknownFunction(req.fn_id.clone())),
            ),
        )
        .await;
        return Ok(worker);
    };

    let ctx = if req.owner == deps.node {
        WorkerContext::local(
            req.handle,
            req.attempt,
            req.checkpoint.clone(),
            Arc::clone(&deps.store),
        )
    } else {
        WorkerContext::remote(
            req.handle,
            req.attempt,
            req.checkpoint.clone(),
            Arc::clone(&deps.transport),
            req.owner.clone(),
        )
    };

    let cancel = CancellationToken::new();
    let child_cancel = cancel.clone();
    let input = req.input.clone();
    let inner = tokio::spawn(async move {
        tokio::select! {
            _ = child_cancel.cancelled() => Err(ExitReason::Cancelled),
            result = function.run(input, ctx) => result.map_err(ExitReason::Error),
        }
    });
    let abort = inner.abort_handle();

    {
        let mut guard = lock(state);
        guard.workers.insert(
            worker,
            WorkerRecord {
                handle: req.handle,
                attempt: req.attempt,
                cancel,
                abort,
            },
        );
        guard.by_attempt.insert((req.handle, req.attempt), worker);
    }

    tracing::info!(
        worker = %worker,
        handle = %req.handle,
        fn_id = %req.fn_id,
        attempt = req.attempt,
        "worker started"
    );
    emit(
        state,
        LifecycleEvent {
            node: deps.node.clone(),
            worker,
            handle: req.handle,
            attempt: req.attempt,
            kind: LifecycleKind::Started,
            at: Utc::now(),
        },
    )
    .await;

    let done_tx = deps.self_tx.clone();
    tokio::spawn(async move {
        let status = match inner.await {
            Ok(Ok(value)) => ExitStatus::Normal(value),
            Ok(Err(reason)) => ExitStatus::Abnormal(reason),
            Err(e) if e.is_panic() => ExitStatus::Abnormal(ExitReason::Panic(panic_message(e))),
            Err(_) => ExitStatus::Abnormal(ExitReason::Cancelled),
        };
        let _ = done_tx
            .send(SupervisorMsg::WorkerDone { worker, status })
            .await;
    });

    Ok(worker)
}

/// Emit `supervisor_restart` for every live worker and clear the table.
async fn flush_workers(state: &Arc<Mutex<State>>, deps: &Arc<Deps>) {
    let drained: Vec<(WorkerId, WorkerRecord)> = {
        let mut guard = lock(state);
        guard.by_attempt.clear();
        guard.workers.drain().collect()
    };

    if drained.is_empty() {
        return;
    }

    tracing::warn!(
        node = %deps.node,
        workers = drained.len(),
        "supervisor restarted with live workers, flushing them"
    );
    for (worker, record) in drained {
        record.abort.abort();
        emit(
            state,
            exit_event(
                &deps.node,
                worker,
                record.handle,
                record.attempt,
                ExitStatus::Abnormal(ExitReason::SupervisorRestart),
            ),
        )
        .await;
    }
}

fn exit_event(
    node: &NodeId,
    worker: WorkerId,
    handle: TaskHandle,
    attempt: u32,
    status: ExitStatus,
) -> LifecycleEvent {
    LifecycleEvent {
        node: node.clone(),
        worker,
        handle,
        attempt,
        kind: LifecycleKind::Exited(status),
        at: Utc::now(),
    }
}

fn lock(state: &Arc<Mutex<State>>) -> std::sync::MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

async fn emit(state: &Arc<Mutex<State>>, event: LifecycleEvent) {
    let sinks = lock(state).sinks.clone();
    let mut dead = Vec::new();

    for sink in &sinks {
        if sink.send(event.clone()).await.is_err() {
            dead.push(sink.clone());
        }
    }

    if !dead.is_empty() {
        lock(state)
            .sinks
            .retain(|s| !dead.iter().any(|d| d.same_channel(s)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionRegistry;
    use crate::transport::in_process::{InProcessHub, InProcessTransport};
    use lattice_store::config::CheckpointConfig;

    fn test_node() -> NodeId {
        NodeId::new("test@localhost")
    }

    fn test_store() -> Arc<CheckpointStore> {
        Arc::new(CheckpointStore::open(&CheckpointConfig::default()).expect("ephemeral open"))
    }

    fn test_transport() -> Arc<dyn Transport> {
        let hub = InProcessHub::new();
        Arc::new(InProcessTransport::new(hub, test_node(), "nocookie"))
    }

    fn spawn_supervisor(registry: FunctionRegistry, config: &SupervisorConfig) -> Supervisor {
        Supervisor::spawn(
            test_node(),
            Arc::new(registry),
            test_store(),
            test_transport(),
            config,
        )
    }

    fn start_req(fn_id: &str, input: &[u8], attempt: u32) -> StartWorker {
        StartWorker {
            owner: test_node(),
            handle: TaskHandle::mint(),
            fn_id: fn_id.to_string(),
            input: input.to_vec(),
            attempt,
            checkpoint: None,
        }
    }

    async fn next_exit(rx: &mut mpsc::Receiver<LifecycleEvent>) -> (LifecycleEvent, ExitStatus) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("lifecycle event should arrive")
                .expect("channel open");
            if let LifecycleKind::Exited(status) = event.kind.clone() {
                return (event, status);
            }
        }
    }

    #[tokio::test]
    async fn normal_exit_carries_value() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("echo", |input, _ctx| async move { Ok(input) });
        let supervisor = spawn_supervisor(registry, &SupervisorConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        supervisor.subscribe(tx).await;

        let req = start_req("echo", b"payload", 1);
        let handle = req.handle;
        supervisor.start(req).await.unwrap();

        let started = rx.recv().await.expect("started event");
        assert!(matches!(started.kind, LifecycleKind::Started));
        assert_eq!(started.handle, handle);

        let (event, status) = next_exit(&mut rx).await;
        assert_eq!(event.handle, handle);
        assert_eq!(status, ExitStatus::Normal(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn function_error_is_abnormal_exit() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("bad", |_, _| async { Err("boom".to_string()) });
        let supervisor = spawn_supervisor(registry, &SupervisorConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        supervisor.subscribe(tx).await;
        supervisor.start(start_req("bad", b"", 1)).await.unwrap();

        let (_, status) = next_exit(&mut rx).await;
        assert_eq!(status, ExitStatus::Abnormal(ExitReason::Error("boom".into())));
    }

    #[tokio::test]
    async fn panic_is_caught_and_reported() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("explode", |_, _| async { panic!("kaboom") });
        let supervisor = spawn_supervisor(registry, &SupervisorConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        supervisor.subscribe(tx).await;
        supervisor.start(start_req("explode", b"", 1)).await.unwrap();

        let (_, status) = next_exit(&mut rx).await;
        match status {
            ExitStatus::Abnormal(ExitReason::Panic(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("expected panic exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_function_exits_without_invoking() {
        let supervisor = spawn_supervisor(FunctionRegistry::new(), &SupervisorConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        supervisor.subscribe(tx).await;
        supervisor.start(start_req("ghost", b"", 1)).await.unwrap();

        let event = rx.recv().await.expect("exit event");
        assert!(matches!(
            event.kind,
            LifecycleKind::Exited(ExitStatus::Abnormal(ExitReason::UnknownFunction(_)))
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent_per_handle_and_attempt() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("wait", |_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        });
        let supervisor = spawn_supervisor(registry, &SupervisorConfig::default());

        let req = start_req("wait", b"", 1);
        let first = supervisor.start(req.clone()).await.unwrap();
        let second = supervisor.start(req).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stop_cancels_a_running_worker() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("wait", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        });
        let supervisor = spawn_supervisor(registry, &SupervisorConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        supervisor.subscribe(tx).await;

        let worker = supervisor.start(start_req("wait", b"", 1)).await.unwrap();
        assert!(supervisor.stop(worker).await);

        let (_, status) = next_exit(&mut rx).await;
        assert_eq!(status, ExitStatus::Abnormal(ExitReason::Cancelled));
    }

    #[tokio::test]
    async fn stop_unknown_worker_returns_false() {
        let supervisor = spawn_supervisor(FunctionRegistry::new(), &SupervisorConfig::default());
        assert!(!supervisor.stop(WorkerId::mint()).await);
    }

    #[tokio::test]
    async fn high_water_mark_rejects_new_starts() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("wait", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        });
        let config = SupervisorConfig {
            high_water_mark: 1,
            ..SupervisorConfig::default()
        };
        let supervisor = spawn_supervisor(registry, &config);

        supervisor.start(start_req("wait", b"", 1)).await.unwrap();
        let result = supervisor.start(start_req("wait", b"", 1)).await;
        assert!(matches!(result, Err(TaskError::NodeOverloaded(_))));
    }

    #[tokio::test]
    async fn restart_flushes_live_workers() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("wait", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        });
        let supervisor = spawn_supervisor(registry, &SupervisorConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        supervisor.subscribe(tx).await;

        let req = start_req("wait", b"", 1);
        let handle = req.handle;
        supervisor.start(req).await.unwrap();
        let _ = rx.recv().await; // started

        supervisor.restart().await;

        let (event, status) = next_exit(&mut rx).await;
        assert_eq!(event.handle, handle);
        assert_eq!(status, ExitStatus::Abnormal(ExitReason::SupervisorRestart));

        // The table is empty; the same attempt can start fresh.
        let again = supervisor
            .start(StartWorker {
                owner: test_node(),
                handle,
                fn_id: "wait".into(),
                input: vec![],
                attempt: 1,
                checkpoint: None,
            })
            .await;
        assert!(again.is_ok());
    }
}

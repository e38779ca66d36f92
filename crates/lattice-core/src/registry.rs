//! Function registry -- the late-binding map from function identifiers
//! to executable task functions.
//!
//! The registry is populated once at node initialization and read-only
//! afterwards; workers resolve `fn_id` against it at start. Unknown ids
//! exit the worker without invoking anything.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use lattice_store::CheckpointStore;

use crate::node_id::NodeId;
use crate::snapshot;
use crate::task::TaskHandle;
use crate::transport::Transport;

/// What a task function produces: output bytes, or an error message that
/// becomes the abnormal exit reason.
pub type FunctionResult = Result<Vec<u8>, String>;

/// A registered task function.
///
/// Implementations receive the opaque input and a [`WorkerContext`]; the
/// context carries the previous attempt's checkpoint (if any) and a
/// best-effort checkpoint writer. Functions that ignore checkpoints work
/// unchanged.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn run(&self, input: Vec<u8>, ctx: WorkerContext) -> FunctionResult;
}

struct ClosureFunction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskFunction for ClosureFunction<F>
where
    F: Fn(Vec<u8>, WorkerContext) -> Fut + Send + Sync,
    Fut: Future<Output = FunctionResult> + Send + 'static,
{
    async fn run(&self, input: Vec<u8>, ctx: WorkerContext) -> FunctionResult {
        (self.f)(input, ctx).await
    }
}

/// Named collection of [`TaskFunction`] implementations.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a name.
    ///
    /// A function already registered under the same name is replaced and
    /// returned.
    pub fn register(
        &mut self,
        name: &str,
        function: impl TaskFunction + 'static,
    ) -> Option<Arc<dyn TaskFunction>> {
        self.functions.insert(name.to_owned(), Arc::new(function))
    }

    /// Register an async closure under a name.
    pub fn register_fn<F, Fut>(&mut self, name: &str, f: F) -> Option<Arc<dyn TaskFunction>>
    where
        F: Fn(Vec<u8>, WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        self.register(name, ClosureFunction { f })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Names of all registered functions (unordered).
    pub fn list(&self) -> Vec<&str> {
        self.functions.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Execution context handed to a running task function.
#[derive(Clone)]
pub struct WorkerContext {
    pub handle: TaskHandle,
    pub attempt: u32,
    checkpoint: Option<Vec<u8>>,
    writer: CheckpointWriter,
}

#[derive(Clone)]
enum CheckpointWriter {
    Local(Arc<CheckpointStore>),
    Remote {
        transport: Arc<dyn Transport>,
        owner: NodeId,
    },
    Detached,
}

impl WorkerContext {
    /// Context for a worker whose owning distributor is on this node.
    pub(crate) fn local(
        handle: TaskHandle,
        attempt: u32,
        checkpoint: Option<Vec<u8>>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            handle,
            attempt,
            checkpoint,
            writer: CheckpointWriter::Local(store),
        }
    }

    /// Context for a worker whose owning distributor lives on `owner`;
    /// checkpoints travel back over the transport.
    pub(crate) fn remote(
        handle: TaskHandle,
        attempt: u32,
        checkpoint: Option<Vec<u8>>,
        transport: Arc<dyn Transport>,
        owner: NodeId,
    ) -> Self {
        Self {
            handle,
            attempt,
            checkpoint,
            writer: CheckpointWriter::Remote { transport, owner },
        }
    }

    /// Context with no checkpoint plumbing, for direct function tests.
    pub fn detached(handle: TaskHandle, attempt: u32) -> Self {
        Self {
            handle,
            attempt,
            checkpoint: None,
            writer: CheckpointWriter::Detached,
        }
    }

    /// Progress saved by the previous attempt, if any.
    pub fn checkpoint(&self) -> Option<&[u8]> {
        self.checkpoint.as_deref()
    }

    /// Persist progress for the next attempt. Best-effort: a failed
    /// write is logged and the task continues without a checkpoint.
    pub async fn save_checkpoint(&self, progress: &[u8]) {
        let result = match &self.writer {
            CheckpointWriter::Local(store) => {
                snapshot::record_progress(store, self.handle, progress).map_err(|e| e.to_string())
            }
            CheckpointWriter::Remote { transport, owner } => transport
                .put_checkpoint(owner, self.handle, progress.to_vec())
                .await
                .map_err(|e| e.to_string()),
            CheckpointWriter::Detached => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(
                handle = %self.handle,
                attempt = self.attempt,
                error = %e,
                "checkpoint save failed, continuing without one"
            );
        }
    }
}

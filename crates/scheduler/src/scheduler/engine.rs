//! Scheduler facade and submission paths

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::config::{NodeConfig, SchedulerConfig};
use crate::actor::{
    Actor, ActorHandle, ActorRegistry, ActorSpec, ActorState, ActorSupervisor, Creation,
    Invocation, PendingCall,
};
use crate::error::{ConfigError, FailureCause, SchedulerError, StoreError, TaskError, TaskFailure};
use crate::gc::{CollectionTarget, GcCoordinator, MemoryUsage, TriggerDecision};
use crate::ids::{ActorId, LeaseId, NodeId, ObjectId, TaskId, WorkerId};
use crate::object::{InMemoryObjectStore, ObjectRef, ObjectStore, ReleaseObject, WaitResult};
use crate::queue::{EntryId, FairQueue, LaneKey, ShapeLoad};
use crate::resources::{Quantity, ResourceLedger, ResourceRequest, ResourceSet};
use crate::task::{ContextScope, FunctionRegistry, TaskArg, TaskContext, TaskDescriptor, TaskFunction, TaskResult};
use crate::worker::WorkerPool;

/// Bookkeeping for a task between submission and its sealed result
pub(crate) struct TaskRecord {
    pub(crate) cancel: CancellationToken,
    /// Queue position while queued
    pub(crate) entry: Option<EntryId>,
    pub(crate) result: ObjectRef,
    pub(crate) parent_worker: Option<WorkerId>,
}

/// A task ready for admission, arguments resolved
pub(crate) struct PendingTask {
    pub(crate) task_id: TaskId,
    pub(crate) function_name: String,
    pub(crate) function: TaskFunction,
    pub(crate) args: Vec<Value>,
    pub(crate) set: ResourceSet,
    pub(crate) depth: u32,
    pub(crate) preferred: Option<NodeId>,
    pub(crate) max_calls: u32,
    pub(crate) max_retries: u32,
    /// 1-based
    pub(crate) attempt: u32,
    pub(crate) admission_timeout: Option<Duration>,
    pub(crate) cancel: CancellationToken,
}

/// Anything that waits in the fair queue
pub(crate) enum PendingWork {
    Task(PendingTask),
    Actor(Creation),
    /// A blocked worker waiting to get its CPU share back
    Resume {
        lease: LeaseId,
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) ledger: Arc<ResourceLedger>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) gc: Arc<GcCoordinator>,
    pub(crate) supervisor: ActorSupervisor,
    pub(crate) functions: FunctionRegistry,
    pub(crate) actor_classes: ActorRegistry,
    pub(crate) queue: Mutex<FairQueue<PendingWork>>,
    pub(crate) tasks: DashMap<TaskId, TaskRecord>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) rounds: AtomicU64,
    pub(crate) external_bytes: AtomicU64,
    /// Shapes already reported as unsatisfiable by every node
    pub(crate) infeasible: DashSet<ResourceSet>,
}

impl SchedulerInner {
    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            object_store_bytes: self.store.memory_usage(),
            worker_heap_bytes: self.pool.total_heap_bytes(),
            external_bytes: self.external_bytes.load(Ordering::Relaxed),
        }
    }
}

impl ReleaseObject for SchedulerInner {
    fn release(&self, id: ObjectId) {
        self.store.free(id);
        trace!(object = %id, "object released");
        self.gc.observe_release(self.memory_usage());
    }
}

/// Task-and-actor scheduler
///
/// Cheap to clone; every clone drives the same cluster.
///
/// ```text
///  submit_task ──▶ resolve refs ──▶ FairQueue ──tick──▶ ResourceLedger ──lease──▶ WorkerPool
///                                       ▲                                            │
///                  Resume lane ◀── get/wait (CPU suspended)                          ▼
///                                                                      seal result ◀─ worker
/// ```
///
/// # Example
///
/// ```
/// use serde_json::{json, Value};
/// use tessera_scheduler::prelude::*;
///
/// # tokio_test::block_on(async {
/// let scheduler = Scheduler::new(SchedulerConfig::single_node(2.0)).unwrap();
/// scheduler.register_function("add", |_ctx, args| async move {
///     let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
///     Ok(json!(sum))
/// });
///
/// let result = scheduler
///     .submit_task(TaskDescriptor::new("add").with_args([json!(2), json!(3)]))
///     .unwrap();
/// assert_eq!(scheduler.get(&result).await.unwrap(), json!(5));
/// scheduler.shutdown();
/// # });
/// ```
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler backed by an [`InMemoryObjectStore`]
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_store(config, Arc::new(InMemoryObjectStore::new()))
    }

    /// Build a scheduler on top of an existing object store
    pub fn with_store(
        config: SchedulerConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let wake = Arc::new(Notify::new());
        let ledger = Arc::new(ResourceLedger::new().with_release_signal(wake.clone()));
        for node in &config.nodes {
            ledger.add_node(node.id.clone(), resource_set(&node.resources)?)?;
        }
        let pool = Arc::new(WorkerPool::new(config.pool.clone()));
        let target: Arc<dyn CollectionTarget> = pool.clone();
        let gc = Arc::new(GcCoordinator::new(config.gc.clone(), target));

        let inner = Arc::new(SchedulerInner {
            store,
            ledger,
            pool,
            gc,
            supervisor: ActorSupervisor::new(),
            functions: FunctionRegistry::new(),
            actor_classes: ActorRegistry::new(),
            queue: Mutex::new(FairQueue::new()),
            tasks: DashMap::new(),
            shutdown: CancellationToken::new(),
            rounds: AtomicU64::new(0),
            external_bytes: AtomicU64::new(0),
            infeasible: DashSet::new(),
            config,
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            wake,
            inner.shutdown.clone(),
            inner.config.tick_interval,
        ));

        info!(
            nodes = inner.config.nodes.len(),
            cpus = inner.config.total_cpus(),
            "scheduler started"
        );
        Ok(Self { inner })
    }

    /// Build from `TESSERA_*` environment variables
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::from_env()?)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register (or replace) a task function
    pub fn register_function<F, Fut>(&self, name: &str, function: F)
    where
        F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.inner.functions.register(name, function);
    }

    /// Register (or replace) an actor class
    pub fn register_actor_class<A, F>(&self, class: &str, factory: F)
    where
        A: Actor,
        F: Fn(Vec<Value>) -> Result<A, TaskFailure> + Send + Sync + 'static,
    {
        self.inner.actor_classes.register(class, factory);
    }

    /// Register a node at runtime
    pub fn add_node(&self, node: NodeConfig) -> Result<(), SchedulerError> {
        let set = resource_set(&node.resources)?;
        self.inner.ledger.add_node(node.id.clone(), set)?;
        let ledger = &self.inner.ledger;
        self.inner
            .infeasible
            .retain(|shape| ledger.validate(&shape.to_f64_map().into_iter().collect()).is_err());
        info!(node = %node.id, "node added");
        Ok(())
    }

    /// Validate a request, warning once per shape that no node can hold
    fn validate_request(&self, request: &ResourceRequest) -> Result<ResourceSet, SchedulerError> {
        self.inner.ledger.validate(request).map_err(|err| {
            if let Some(shape) = resource_set(request).ok().filter(|shape| !shape.is_empty()) {
                if self.inner.infeasible.insert(shape.clone()) {
                    warn!(
                        %shape,
                        error = %err,
                        "infeasible resource request, no node can ever satisfy it"
                    );
                }
            }
            SchedulerError::ResourceRejected(err.to_string())
        })
    }

    /// Shapes rejected as infeasible so far, each reported once
    pub fn infeasible_shapes(&self) -> Vec<ResourceSet> {
        let mut shapes: Vec<_> = self.inner.infeasible.iter().map(|s| s.key().clone()).collect();
        shapes.sort();
        shapes
    }

    /// Tie an object's lifetime to the refs handed out for it
    fn track(&self, object: ObjectRef) -> ObjectRef {
        let owner: Weak<dyn ReleaseObject> = Arc::downgrade(&self.inner) as Weak<SchedulerInner>;
        object.tracked(owner)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a top-level task
    ///
    /// Fails synchronously with [`SchedulerError::ResourceRejected`] when no
    /// node could ever hold the request; every other failure is delivered
    /// through the returned ref.
    #[instrument(skip(self, task), fields(function = %task.function))]
    pub fn submit_task(&self, task: TaskDescriptor) -> Result<ObjectRef, SchedulerError> {
        self.submit_from(None, task)
    }

    pub(crate) fn submit_from(
        &self,
        parent: Option<&ContextScope>,
        task: TaskDescriptor,
    ) -> Result<ObjectRef, SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let function = inner
            .functions
            .get(&task.function)
            .ok_or_else(|| SchedulerError::UnknownFunction(task.function.clone()))?;
        let set = self.validate_request(&task.resources)?;

        let task_id = TaskId::new();
        let result = self.track(inner.store.create_pending(Some(task_id)));
        let cancel = inner.shutdown.child_token();
        let parent_worker = parent.map(|scope| scope.worker);
        let depth = parent.map_or(0, |scope| scope.depth + 1);

        inner.tasks.insert(
            task_id,
            TaskRecord {
                cancel: cancel.clone(),
                entry: None,
                result: result.clone(),
                parent_worker,
            },
        );
        if let Some(worker) = parent_worker {
            inner.pool.track_child(worker, task_id);
        }

        let pending = PendingTask {
            task_id,
            function_name: task.function.clone(),
            function,
            args: Vec::new(),
            set,
            depth,
            preferred: parent.map(|scope| scope.node.clone()),
            max_calls: task.max_calls,
            max_retries: task.max_retries,
            attempt: 1,
            admission_timeout: task.admission_timeout,
            cancel,
        };
        debug!(task = %task_id, function = %task.function, depth, "task submitted");

        if task.dependencies().next().is_none() {
            let mut pending = pending;
            pending.args = task
                .args
                .into_iter()
                .filter_map(|arg| match arg {
                    TaskArg::Value(value) => Some(value),
                    TaskArg::Ref(_) => None,
                })
                .collect();
            self.enqueue(pending);
            self.schedule();
        } else {
            tokio::spawn(self.clone().resolve_and_enqueue(task.args, pending));
        }
        Ok(result)
    }

    /// Await `Ref` arguments, then queue the task
    ///
    /// No lease is held while waiting.
    async fn resolve_and_enqueue(self, args: Vec<TaskArg>, mut task: PendingTask) {
        let store = self.inner.store.clone();
        let resolve = async {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                match arg {
                    TaskArg::Value(value) => values.push(value),
                    TaskArg::Ref(object) => values.push(store.get(&object).await?),
                }
            }
            Ok::<_, StoreError>(values)
        };

        let cancel = task.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => self.finish_task(task.task_id, Err(TaskError::Cancelled)),
            resolved = resolve => match resolved {
                Ok(values) => {
                    task.args = values;
                    self.enqueue(task);
                    self.schedule();
                }
                Err(err) => {
                    let cause = match err {
                        StoreError::Failed(upstream) => FailureCause::Upstream(Box::new(upstream)),
                        other => FailureCause::Application(other.to_string()),
                    };
                    self.finish_task(task.task_id, Err(TaskError::TaskFailed { attempts: 0, cause }));
                }
            },
        }
    }

    pub(crate) fn enqueue(&self, task: PendingTask) {
        let task_id = task.task_id;
        let deadline = task.admission_timeout.map(|timeout| Instant::now() + timeout);
        let lane = LaneKey::Depth(task.depth);
        let shape = task.set.clone();

        let mut queue = self.inner.queue.lock();
        let entry = queue.push(lane, shape, deadline, PendingWork::Task(task));
        if let Some(mut record) = self.inner.tasks.get_mut(&task_id) {
            record.entry = Some(entry);
        }
    }

    /// Submit a call to an actor method
    ///
    /// Calls to a killed actor return a ref that fails with
    /// [`TaskError::ActorUnavailable`].
    pub fn submit_actor_call(
        &self,
        actor: &ActorHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ObjectRef, SchedulerError> {
        self.invoke_from(None, actor, method, args)
    }

    pub(crate) fn invoke_from(
        &self,
        parent: Option<&ContextScope>,
        actor: &ActorHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ObjectRef, SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let actor_id = actor.id();
        let result = self.track(self.inner.store.create_pending(None));
        let call = PendingCall {
            result: result.clone(),
            method: method.to_string(),
            args,
            depth: parent.map_or(1, |scope| scope.depth + 1),
        };

        let invocation = self
            .inner
            .supervisor
            .invoke(actor_id, call, |binding, call| self.deliver(actor_id, binding, call))?;
        match invocation {
            Invocation::Delivered | Invocation::Buffered => {}
            Invocation::Rejected { call, reason } => {
                self.seal(&call.result, Err(TaskError::actor_unavailable(actor_id, reason)));
            }
        }
        Ok(result)
    }

    /// Create an actor; construction is queued like a task
    #[instrument(skip(self, spec), fields(class = %spec.class))]
    pub fn create_actor(&self, spec: ActorSpec) -> Result<ActorHandle, SchedulerError> {
        self.create_from(None, spec)
    }

    pub(crate) fn create_from(
        &self,
        parent: Option<&ContextScope>,
        spec: ActorSpec,
    ) -> Result<ActorHandle, SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let factory = inner
            .actor_classes
            .get(&spec.class)
            .ok_or_else(|| SchedulerError::UnknownActorClass(spec.class.clone()))?;
        let set = self.validate_request(&spec.resources)?;

        let id = ActorId::new();
        let creation = inner.supervisor.register(
            id,
            &spec.class,
            factory,
            spec.args,
            set,
            spec.max_restarts,
            parent.map_or(0, |scope| scope.depth + 1),
            parent.map(|scope| scope.node.clone()),
        );
        self.enqueue_creation(creation);
        self.schedule();

        info!(actor = %id, class = %spec.class, "actor created");
        Ok(ActorHandle::new(id, spec.class))
    }

    pub(crate) fn enqueue_creation(&self, creation: Creation) {
        let lane = LaneKey::Depth(creation.depth);
        let shape = creation.set.clone();
        self.inner
            .queue
            .lock()
            .push(lane, shape, None, PendingWork::Actor(creation));
    }

    /// Kill an actor
    ///
    /// `no_restart = true` kills it for good and releases its lease at once.
    /// Otherwise the kill counts against the restart budget. Killing a killed
    /// actor is a no-op.
    pub fn kill_actor(&self, actor: &ActorHandle, no_restart: bool) -> Result<(), SchedulerError> {
        let action = self.inner.supervisor.kill(actor.id(), no_restart)?;
        self.apply_exit(actor.id(), action);
        Ok(())
    }

    pub fn actor_state(&self, actor: &ActorHandle) -> Option<ActorState> {
        self.inner.supervisor.state(actor.id())
    }

    pub fn actor_restart_count(&self, actor: &ActorHandle) -> Option<u32> {
        self.inner.supervisor.restart_count(actor.id())
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a task that is resolving, queued or running
    ///
    /// Returns `false` for unknown or already finished tasks.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let entry = match self.inner.tasks.get(&task_id) {
            Some(record) => {
                record.cancel.cancel();
                record.entry
            }
            None => return false,
        };

        if let Some(entry) = entry {
            let removed = self.inner.queue.lock().remove(entry);
            if removed.is_some() {
                self.finish_task(task_id, Err(TaskError::Cancelled));
            }
        }
        info!(task = %task_id, "task cancelled");
        true
    }

    /// Cancel the task producing `object`
    pub fn cancel(&self, object: &ObjectRef) -> bool {
        object.owner().is_some_and(|task| self.cancel_task(task))
    }

    /// Cancel every unfinished task submitted from a worker that died
    ///
    /// Nothing is left to consume their results.
    pub(crate) fn cancel_orphans(&self, worker: WorkerId) -> usize {
        let orphans: Vec<TaskId> = self
            .inner
            .tasks
            .iter()
            .filter(|record| record.parent_worker == Some(worker))
            .map(|record| *record.key())
            .collect();
        if !orphans.is_empty() {
            warn!(%worker, orphans = orphans.len(), "owner worker died, cancelling its child tasks");
        }
        for task in &orphans {
            self.cancel_task(*task);
        }
        orphans.len()
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn put(&self, value: Value) -> Result<ObjectRef, StoreError> {
        let object = self.track(self.inner.store.put(value).await?);
        self.observe_memory();
        Ok(object)
    }

    /// Free objects now, pinned or not; later `get`s fail with
    /// [`StoreError::NotFound`]
    pub fn free(&self, refs: &[ObjectRef]) {
        for object in refs {
            self.inner.store.free(object.id());
        }
        self.observe_memory();
    }

    pub async fn get(&self, object: &ObjectRef) -> Result<Value, StoreError> {
        self.inner.store.get(object).await
    }

    /// Wait for `num_returns` refs; the timeout never cancels producers
    pub async fn wait(
        &self,
        refs: &[ObjectRef],
        num_returns: usize,
        timeout: Option<Duration>,
    ) -> WaitResult {
        self.inner.store.wait(refs, num_returns, timeout).await
    }

    pub(crate) fn store(&self) -> &dyn ObjectStore {
        self.inner.store.as_ref()
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Unreserved resources summed over all nodes
    pub fn available_resources(&self) -> BTreeMap<String, f64> {
        self.inner.ledger.available_total()
    }

    /// Declared resources summed over all nodes
    pub fn total_resources(&self) -> BTreeMap<String, f64> {
        self.inner.ledger.totals()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }

    /// Queued demand grouped by resource shape
    pub fn resource_load_by_shape(&self) -> Vec<ShapeLoad> {
        self.inner.queue.lock().load_by_shape()
    }

    /// Tasks submitted whose result is not sealed yet
    pub fn pending_task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Bytes held by sealed objects
    pub fn object_store_bytes(&self) -> u64 {
        self.inner.store.memory_usage()
    }

    /// Entries waiting in the fair queue, including actor creations
    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Scheduling ticks run so far
    pub fn scheduling_rounds(&self) -> u64 {
        self.inner.rounds.load(Ordering::Relaxed)
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn gc(&self) -> &GcCoordinator {
        &self.inner.gc
    }

    /// Feed usage measured outside the scheduler into the GC trigger
    pub fn report_memory_usage(&self, bytes: u64) -> TriggerDecision {
        self.inner.external_bytes.store(bytes, Ordering::Relaxed);
        self.observe_memory()
    }

    pub(crate) fn observe_memory(&self) -> TriggerDecision {
        self.inner.gc.observe(self.inner.memory_usage())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Cancel all work, kill all actors and exit every worker
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!(pending = inner.tasks.len(), "scheduler shutting down");
        inner.shutdown.cancel();

        let queued: Vec<_> = {
            let mut queue = inner.queue.lock();
            let ids: Vec<_> = queue.iter().map(|entry| entry.id).collect();
            ids.into_iter().filter_map(|id| queue.remove(id)).collect()
        };
        for entry in queued {
            if let PendingWork::Task(task) = entry.item {
                self.finish_task(task.task_id, Err(TaskError::Cancelled));
            }
        }

        for (actor, action) in inner.supervisor.kill_all() {
            self.apply_exit(actor, action);
        }
        inner.pool.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Seal a result, tolerating a second seal of the same object
    pub(crate) fn seal(&self, object: &ObjectRef, result: Result<Value, TaskError>) {
        if let Err(err) = self.inner.store.seal(object.id(), result) {
            debug!(object = %object, error = %err, "result already sealed");
        }
    }

    /// Seal a task's result and settle its bookkeeping
    ///
    /// Idempotent: only the first call for a task has an effect.
    pub(crate) fn finish_task(&self, task_id: TaskId, outcome: Result<Value, TaskError>) {
        let Some((_, record)) = self.inner.tasks.remove(&task_id) else {
            return;
        };
        match &outcome {
            Ok(_) => debug!(task = %task_id, "task finished"),
            Err(err) => info!(task = %task_id, kind = ?err.kind(), error = %err, "task failed"),
        }
        self.seal(&record.result, outcome);
        if let Some(parent) = record.parent_worker {
            self.inner.pool.child_settled(parent, task_id);
        }
        self.observe_memory();
    }

    /// Build a context for code running on `worker`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn context(
        &self,
        task_id: Option<TaskId>,
        actor_id: Option<ActorId>,
        worker: WorkerId,
        node: NodeId,
        depth: u32,
        lease: Option<LeaseId>,
        attempt: u32,
    ) -> TaskContext {
        TaskContext::new(
            self.clone(),
            ContextScope {
                task_id,
                actor_id,
                worker,
                node,
                depth,
                lease,
                attempt,
                exit_requested: AtomicBool::new(false),
            },
        )
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("nodes", &self.inner.ledger.nodes())
            .field("pending_tasks", &self.inner.tasks.len())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

/// Convert declared node resources into a fixed-point set
fn resource_set(request: &ResourceRequest) -> Result<ResourceSet, ConfigError> {
    let mut set = ResourceSet::new();
    for (name, amount) in request.iter() {
        let quantity = Quantity::from_f64(amount)
            .ok_or_else(|| ConfigError::Invalid(format!("invalid quantity {amount} for {name}")))?;
        set.insert(name, quantity);
    }
    Ok(set)
}

/// Background tick: runs on every release signal and on a fixed period
async fn dispatch_loop(
    inner: Weak<SchedulerInner>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    period: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(period) => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Scheduler { inner }.schedule();
    }
    debug!("dispatch loop stopped");
}

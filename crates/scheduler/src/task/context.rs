//! Execution context handed to task functions and actor methods

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::descriptor::TaskDescriptor;
use crate::actor::{ActorHandle, ActorSpec};
use crate::error::{SchedulerError, StoreError};
use crate::ids::{ActorId, LeaseId, NodeId, TaskId, WorkerId};
use crate::object::{ObjectRef, WaitResult};
use crate::scheduler::Scheduler;

/// Where a piece of user code is running
#[derive(Debug)]
pub(crate) struct ContextScope {
    pub(crate) task_id: Option<TaskId>,
    pub(crate) actor_id: Option<ActorId>,
    pub(crate) worker: WorkerId,
    pub(crate) node: NodeId,
    /// Call depth of the running code; children go one lane deeper
    pub(crate) depth: u32,
    pub(crate) lease: Option<LeaseId>,
    pub(crate) attempt: u32,
    pub(crate) exit_requested: AtomicBool,
}

/// Handle into the scheduler from inside running user code
///
/// Blocking calls ([`get`](Self::get), [`wait`](Self::wait)) give the CPU
/// share of the caller's lease back while they wait, so a task can block on
/// its own children even when they need the same CPU.
#[derive(Clone)]
pub struct TaskContext {
    scheduler: Scheduler,
    scope: Arc<ContextScope>,
}

impl TaskContext {
    pub(crate) fn new(scheduler: Scheduler, scope: ContextScope) -> Self {
        Self {
            scheduler,
            scope: Arc::new(scope),
        }
    }

    /// Running task, if this is a task
    pub fn task_id(&self) -> Option<TaskId> {
        self.scope.task_id
    }

    /// Hosting actor, if this is an actor method
    pub fn actor_id(&self) -> Option<ActorId> {
        self.scope.actor_id
    }

    /// Worker running this code; stable for its process lifetime
    pub fn worker_id(&self) -> WorkerId {
        self.scope.worker
    }

    pub fn node_id(&self) -> &NodeId {
        &self.scope.node
    }

    pub fn depth(&self) -> u32 {
        self.scope.depth
    }

    /// 1 on the first try, incremented per crash retry
    pub fn attempt(&self) -> u32 {
        self.scope.attempt
    }

    /// Submit a child task; it is queued one lane deeper than this code
    pub fn submit_task(&self, task: TaskDescriptor) -> Result<ObjectRef, SchedulerError> {
        self.scheduler.submit_from(Some(&self.scope), task)
    }

    pub fn submit_actor_call(
        &self,
        actor: &ActorHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ObjectRef, SchedulerError> {
        self.scheduler
            .invoke_from(Some(&self.scope), actor, method, args)
    }

    pub fn create_actor(&self, spec: ActorSpec) -> Result<ActorHandle, SchedulerError> {
        self.scheduler.create_from(Some(&self.scope), spec)
    }

    pub fn kill_actor(&self, actor: &ActorHandle, no_restart: bool) -> Result<(), SchedulerError> {
        self.scheduler.kill_actor(actor, no_restart)
    }

    pub async fn put(&self, value: Value) -> Result<ObjectRef, StoreError> {
        self.scheduler.put(value).await
    }

    /// Fetch an object, releasing this code's CPU while it is not ready
    pub async fn get(&self, object: &ObjectRef) -> Result<Value, StoreError> {
        let store = self.scheduler.store();
        if store.is_ready(object.id()) {
            return store.get(object).await;
        }
        self.scheduler
            .while_blocked(&self.scope, store.get(object))
            .await
    }

    /// Wait for `num_returns` of `refs`, releasing CPU while blocked
    pub async fn wait(
        &self,
        refs: &[ObjectRef],
        num_returns: usize,
        timeout: Option<Duration>,
    ) -> WaitResult {
        let store = self.scheduler.store();
        let ready = refs.iter().filter(|r| store.is_ready(r.id())).count();
        if ready >= num_returns.min(refs.len()) {
            return store.wait(refs, num_returns, Some(Duration::ZERO)).await;
        }
        self.scheduler
            .while_blocked(&self.scope, store.wait(refs, num_returns, timeout))
            .await
    }

    /// Ask the hosting actor to exit after the current method
    ///
    /// Counts against the restart budget like a crash. No effect in tasks.
    pub fn exit_actor(&self) {
        self.scope.exit_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.scope.exit_requested.load(Ordering::SeqCst)
    }

    /// Report this worker's heap usage for the GC trigger
    pub fn report_heap_usage(&self, bytes: u64) {
        self.scheduler
            .worker_pool()
            .set_heap_usage(self.scope.worker, bytes);
        self.scheduler.observe_memory();
    }

    pub fn available_resources(&self) -> BTreeMap<String, f64> {
        self.scheduler.available_resources()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

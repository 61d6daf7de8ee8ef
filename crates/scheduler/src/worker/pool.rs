//! Worker pool manager
//!
//! Owns every worker, decides reuse, and enforces recycling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, instrument, warn};

use super::runtime::{worker_loop, WorkerCommand};
use crate::error::ConfigError;
use crate::gc::{CollectionReport, CollectionTarget};
use crate::ids::{NodeId, TaskId, WorkerId};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Cap on task workers running unblocked at once; `None` = unlimited
    pub max_active_workers: Option<usize>,

    /// Idle workers kept per node for reuse; extras exit
    pub max_idle_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_active_workers: None,
            max_idle_workers: 16,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_active_workers(mut self, max: usize) -> Self {
        self.max_active_workers = Some(max.max(1));
        self
    }

    pub fn with_max_idle_workers(mut self, max: usize) -> Self {
        self.max_idle_workers = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_workers == Some(0) {
            return Err(ConfigError::Invalid(
                "max_active_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for an assignment
    Idle,
    /// Running a task or hosting an actor
    Busy,
    /// Reached `max_calls`; finishing current work and children, no new work
    Draining,
    /// Gone
    Exited,
}

/// What the worker hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Task,
    Actor,
}

/// How an assignment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Completed,
    Crashed,
    Cancelled,
}

/// Exclusive handle to an assigned worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    node: NodeId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Deliver a command; returns it back if the worker is gone
    pub fn send(&self, command: WorkerCommand) -> Result<(), WorkerCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub node: NodeId,
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub calls: u32,
    pub max_calls: u32,
    pub blocked: bool,
    pub outstanding_children: usize,
    pub heap_bytes: u64,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerInfo>,
    pub active: usize,
    pub idle: usize,
    pub exited: usize,
}

struct WorkerRecord {
    node: NodeId,
    kind: WorkerKind,
    state: watch::Sender<WorkerState>,
    running: bool,
    blocked: bool,
    calls: u32,
    max_calls: u32,
    children: HashSet<TaskId>,
    heap_bytes: u64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    started_at: DateTime<Utc>,
}

impl WorkerRecord {
    fn current(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn set(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Whether this worker occupies an active slot
    fn is_active(&self) -> bool {
        self.kind == WorkerKind::Task && self.running && !self.blocked
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerRecord>,
    idle: HashMap<NodeId, Vec<WorkerId>>,
    exited: HashMap<WorkerId, watch::Receiver<WorkerState>>,
    active: usize,
}

impl PoolState {
    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    fn remove_idle(&mut self, id: WorkerId, node: &NodeId) {
        if let Some(ids) = self.idle.get_mut(node) {
            ids.retain(|w| *w != id);
        }
    }

    /// Tear down a worker that has nothing left to do
    fn exit(&mut self, id: WorkerId) {
        let Some(record) = self.workers.remove(&id) else {
            return;
        };
        if record.is_active() {
            self.active -= 1;
        }
        self.remove_idle(id, &record.node);
        let _ = record.commands.send(WorkerCommand::Exit);
        record.set(WorkerState::Exited);
        self.exited.insert(id, record.state.subscribe());
        debug!(worker = %id, node = %record.node, calls = record.calls, "worker exited");
    }

    /// Exit a draining worker once it is idle and its children have settled
    fn maybe_finish_draining(&mut self, id: WorkerId) {
        let done = self.workers.get(&id).is_some_and(|r| {
            r.current() == WorkerState::Draining && !r.running && r.children.is_empty()
        });
        if done {
            self.exit(id);
        }
    }
}

/// Worker pool
///
/// ```text
///            acquire(node, max_calls)
///                     │
///      ┌──────────────▼──────────────┐
///      │ idle worker on node?        │── no ──▶ spawn worker_loop
///      └──────────────┬──────────────┘
///                     ▼
///   Idle ──▶ Busy ──(calls == max_calls)──▶ Draining ──(children settled)──▶ Exited
///     ▲        │
///     └────────┘ release(Completed)
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    capacity: Notify,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            capacity: Notify::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn spawn_worker(&self, node: &NodeId, kind: WorkerKind) -> (WorkerId, WorkerRecord) {
        let id = WorkerId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (commands, mailbox) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(WorkerState::Idle);
        tokio::spawn(worker_loop(id, mailbox));
        debug!(worker = %id, %node, ?kind, "worker spawned");

        let record = WorkerRecord {
            node: node.clone(),
            kind,
            state,
            running: false,
            blocked: false,
            calls: 0,
            max_calls: 0,
            children: HashSet::new(),
            heap_bytes: 0,
            commands,
            started_at: Utc::now(),
        };
        (id, record)
    }

    /// Assign a task worker on `node`, waiting while the active cap is reached
    ///
    /// `max_calls` of 0 means the worker may be reused indefinitely.
    #[instrument(skip(self), level = "trace")]
    pub async fn acquire(&self, node: &NodeId, max_calls: u32) -> WorkerHandle {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                let has_slot = self
                    .config
                    .max_active_workers
                    .map_or(true, |max| state.active < max);
                if has_slot {
                    return self.assign(&mut state, node, max_calls);
                }
            }

            notified.await;
        }
    }

    fn assign(&self, state: &mut PoolState, node: &NodeId, max_calls: u32) -> WorkerHandle {
        let reused = state
            .idle
            .get_mut(node)
            .and_then(Vec::pop)
            .and_then(|id| state.workers.remove(&id).map(|record| (id, record)));
        let (id, mut record) = match reused {
            Some(found) => found,
            None => self.spawn_worker(node, WorkerKind::Task),
        };

        record.running = true;
        record.calls += 1;
        record.max_calls = max_calls;
        let draining = max_calls > 0 && record.calls >= max_calls;
        if draining {
            debug!(worker = %id, max_calls, "worker reached max_calls, draining");
            record.set(WorkerState::Draining);
        } else {
            record.set(WorkerState::Busy);
        }

        let commands = record.commands.clone();
        state.workers.insert(id, record);
        state.active += 1;

        WorkerHandle {
            id,
            node: node.clone(),
            commands,
        }
    }

    /// Return a task worker after its assignment ended
    pub fn release(&self, handle: WorkerHandle, kind: ReleaseKind) {
        let mut state = self.state.lock();
        let id = handle.id;
        let Some(record) = state.workers.get_mut(&id) else {
            return;
        };
        let was_active = record.is_active();
        record.running = false;
        record.blocked = false;
        if was_active {
            state.active -= 1;
            self.capacity.notify_one();
        }

        match kind {
            ReleaseKind::Crashed | ReleaseKind::Cancelled => {
                // The event loop is already gone
                state.exit(id);
            }
            ReleaseKind::Completed => {
                let Some(record) = state.workers.get(&id) else {
                    return;
                };
                if record.current() == WorkerState::Draining {
                    state.maybe_finish_draining(id);
                } else if state.idle.get(&handle.node).map_or(0, Vec::len)
                    >= self.config.max_idle_workers
                {
                    state.exit(id);
                } else {
                    record.set(WorkerState::Idle);
                    state.idle.entry(handle.node.clone()).or_default().push(id);
                }
            }
        }
    }

    /// Spawn a worker dedicated to one actor binding
    ///
    /// Actor workers never count toward the active cap and are never reused.
    pub fn acquire_dedicated(&self, node: &NodeId) -> WorkerHandle {
        let (id, mut record) = self.spawn_worker(node, WorkerKind::Actor);
        record.running = true;
        record.calls = 1;
        record.set(WorkerState::Busy);
        let commands = record.commands.clone();
        self.state.lock().workers.insert(id, record);

        WorkerHandle {
            id,
            node: node.clone(),
            commands,
        }
    }

    /// Terminate a worker immediately
    pub fn retire(&self, id: WorkerId) {
        let mut state = self.state.lock();
        let was_active = state.workers.get(&id).is_some_and(WorkerRecord::is_active);
        state.exit(id);
        if was_active {
            self.capacity.notify_one();
        }
    }

    /// The worker is blocked in `get`/`wait` and frees its active slot
    pub fn mark_blocked(&self, id: WorkerId) {
        let mut state = self.state.lock();
        let Some(record) = state.workers.get_mut(&id) else {
            return;
        };
        if record.blocked {
            return;
        }
        let was_active = record.is_active();
        record.blocked = true;
        if was_active {
            state.active -= 1;
            self.capacity.notify_one();
        }
    }

    /// The worker resumed after a blocking call
    ///
    /// May briefly exceed the active cap; the worker already holds its lease.
    pub fn mark_unblocked(&self, id: WorkerId) {
        let mut state = self.state.lock();
        let Some(record) = state.workers.get_mut(&id) else {
            return;
        };
        if !record.blocked {
            return;
        }
        record.blocked = false;
        if record.is_active() {
            state.active += 1;
        }
    }

    /// Record a child task submitted from `worker`
    pub fn track_child(&self, worker: WorkerId, child: TaskId) {
        if let Some(record) = self.state.lock().workers.get_mut(&worker) {
            record.children.insert(child);
        }
    }

    /// A child's result is sealed; a draining parent may now exit
    pub fn child_settled(&self, worker: WorkerId, child: TaskId) {
        let mut state = self.state.lock();
        let Some(record) = state.workers.get_mut(&worker) else {
            return;
        };
        record.children.remove(&child);
        state.maybe_finish_draining(worker);
    }

    /// Exit idle workers beyond `keep` per node
    ///
    /// Workers with unsettled children are kept.
    pub fn shrink_idle(&self, keep: usize) -> usize {
        let mut state = self.state.lock();
        let mut victims = Vec::new();
        for ids in state.idle.values() {
            victims.extend(ids.iter().rev().skip(keep).copied());
        }
        victims.retain(|id| {
            state
                .workers
                .get(id)
                .is_some_and(|r| r.children.is_empty())
        });
        for id in &victims {
            state.exit(*id);
        }
        if !victims.is_empty() {
            info!(count = victims.len(), "shrunk idle workers");
        }
        victims.len()
    }

    pub fn worker_state(&self, id: WorkerId) -> Option<WorkerState> {
        let state = self.state.lock();
        match state.workers.get(&id) {
            Some(record) => Some(record.current()),
            None if state.exited.contains_key(&id) => Some(WorkerState::Exited),
            None => None,
        }
    }

    /// Wait until the worker has exited
    pub async fn wait_for_exit(&self, id: WorkerId) {
        let rx = {
            let state = self.state.lock();
            match state.workers.get(&id) {
                Some(record) => record.state.subscribe(),
                None => match state.exited.get(&id) {
                    Some(rx) => rx.clone(),
                    None => return,
                },
            }
        };
        let mut rx = rx;
        // A closed channel also means the record is gone
        let _ = rx.wait_for(|s| *s == WorkerState::Exited).await;
    }

    /// Record a worker's reported heap usage
    pub fn set_heap_usage(&self, id: WorkerId, bytes: u64) {
        if let Some(record) = self.state.lock().workers.get_mut(&id) {
            record.heap_bytes = bytes;
        }
    }

    /// Heap bytes reported by live workers
    pub fn total_heap_bytes(&self) -> u64 {
        self.state
            .lock()
            .workers
            .values()
            .map(|r| r.heap_bytes)
            .sum()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        let mut workers: Vec<_> = state
            .workers
            .iter()
            .map(|(id, r)| WorkerInfo {
                id: *id,
                node: r.node.clone(),
                kind: r.kind,
                state: r.current(),
                calls: r.calls,
                max_calls: r.max_calls,
                blocked: r.blocked,
                outstanding_children: r.children.len(),
                heap_bytes: r.heap_bytes,
                started_at: r.started_at,
            })
            .collect();
        workers.sort_by_key(|w| w.id);
        PoolSnapshot {
            workers,
            active: state.active,
            idle: state.idle_count(),
            exited: state.exited.len(),
        }
    }

    /// Exit every worker
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let ids: Vec<_> = state.workers.keys().copied().collect();
        for id in ids {
            state.exit(id);
        }
        self.capacity.notify_waiters();
    }
}

impl CollectionTarget for WorkerPool {
    fn request_collection(&self) -> Vec<oneshot::Receiver<CollectionReport>> {
        let state = self.state.lock();
        state
            .workers
            .iter()
            .filter_map(|(id, record)| {
                let (reply, rx) = oneshot::channel();
                match record.commands.send(WorkerCommand::Collect { reply }) {
                    Ok(()) => Some(rx),
                    Err(_) => {
                        warn!(worker = %id, "worker mailbox closed, skipping collection");
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::new("node-0")
    }

    #[tokio::test]
    async fn test_idle_worker_is_reused() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let first = pool.acquire(&node(), 0).await;
        let id = first.id();
        assert_eq!(pool.worker_state(id), Some(WorkerState::Busy));

        pool.release(first, ReleaseKind::Completed);
        assert_eq!(pool.worker_state(id), Some(WorkerState::Idle));

        let second = pool.acquire(&node(), 0).await;
        assert_eq!(second.id(), id);
    }

    #[tokio::test]
    async fn test_max_calls_drains_then_exits() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let handle = pool.acquire(&node(), 1).await;
        let id = handle.id();
        assert_eq!(pool.worker_state(id), Some(WorkerState::Draining));

        pool.release(handle, ReleaseKind::Completed);
        assert_eq!(pool.worker_state(id), Some(WorkerState::Exited));

        // A drained worker is never handed out again
        let next = pool.acquire(&node(), 1).await;
        assert_ne!(next.id(), id);
    }

    #[tokio::test]
    async fn test_draining_worker_waits_for_children() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let handle = pool.acquire(&node(), 1).await;
        let id = handle.id();
        let child = TaskId::new();
        pool.track_child(id, child);

        pool.release(handle, ReleaseKind::Completed);
        assert_eq!(pool.worker_state(id), Some(WorkerState::Draining));

        pool.child_settled(id, child);
        assert_eq!(pool.worker_state(id), Some(WorkerState::Exited));
        pool.wait_for_exit(id).await;
    }

    #[tokio::test]
    async fn test_crash_exits_worker() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let handle = pool.acquire(&node(), 0).await;
        let id = handle.id();
        pool.release(handle, ReleaseKind::Crashed);
        assert_eq!(pool.worker_state(id), Some(WorkerState::Exited));
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_active_cap_excludes_blocked_workers() {
        let pool = std::sync::Arc::new(WorkerPool::new(
            WorkerPoolConfig::default().with_max_active_workers(1),
        ));
        let first = pool.acquire(&node(), 0).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&node(), 0).await.id() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pool.mark_blocked(first.id());
        let second = waiter.await.unwrap();
        assert_ne!(second, first.id());

        pool.mark_unblocked(first.id());
        assert_eq!(pool.active_count(), 2);
    }

    #[tokio::test]
    async fn test_shrink_idle_keeps_parents() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let a = pool.acquire(&node(), 0).await;
        let b = pool.acquire(&node(), 0).await;
        let (a_id, b_id) = (a.id(), b.id());
        pool.track_child(a_id, TaskId::new());
        pool.release(a, ReleaseKind::Completed);
        pool.release(b, ReleaseKind::Completed);

        assert_eq!(pool.shrink_idle(0), 1);
        assert_eq!(pool.worker_state(a_id), Some(WorkerState::Idle));
        assert_eq!(pool.worker_state(b_id), Some(WorkerState::Exited));
    }

    #[tokio::test]
    async fn test_dedicated_workers_do_not_count() {
        let pool = WorkerPool::new(WorkerPoolConfig::default().with_max_active_workers(1));
        let actor = pool.acquire_dedicated(&node());
        let task = pool.acquire(&node(), 0).await;
        assert_eq!(pool.active_count(), 1);

        pool.retire(actor.id());
        assert_eq!(pool.worker_state(actor.id()), Some(WorkerState::Exited));
        pool.release(task, ReleaseKind::Completed);
    }

    #[tokio::test]
    async fn test_collection_reaches_every_live_worker() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let a = pool.acquire(&node(), 0).await;
        let _b = pool.acquire_dedicated(&node());
        pool.release(a, ReleaseKind::Completed);

        let replies = pool.request_collection();
        assert_eq!(replies.len(), 2);
        for reply in replies {
            assert!(!reply.await.unwrap().reclaimed);
        }
    }
}

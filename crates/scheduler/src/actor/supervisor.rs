//! Actor supervision state machine
//!
//! The supervisor only decides. Executing a decision (retiring a worker,
//! releasing a lease, queueing a creation, sealing failed calls) is left to
//! the scheduler so no I/O happens under the supervisor lock apart from
//! mailbox sends, which never block.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{ActorState, ExitReason};
use super::instance::ActorFactory;
use crate::error::SchedulerError;
use crate::ids::{ActorId, NodeId};
use crate::object::ObjectRef;
use crate::resources::{LeaseGuard, ResourceSet};
use crate::worker::WorkerHandle;

/// A method call waiting for, or being delivered to, a live binding
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub(crate) result: ObjectRef,
    pub(crate) method: String,
    pub(crate) args: Vec<Value>,
    /// Depth the method body runs at
    pub(crate) depth: u32,
}

/// A live actor instance: its worker and the lease it holds
#[derive(Debug)]
pub(crate) struct ActorBinding {
    pub(crate) worker: WorkerHandle,
    pub(crate) lease: LeaseGuard,
    /// Cancels every call still running or queued on this worker
    pub(crate) cancel: CancellationToken,
    pub(crate) generation: u64,
}

/// Request to build one generation of an actor
pub(crate) struct Creation {
    pub(crate) actor: ActorId,
    pub(crate) generation: u64,
    pub(crate) factory: ActorFactory,
    pub(crate) args: Vec<Value>,
    pub(crate) set: ResourceSet,
    pub(crate) depth: u32,
    pub(crate) preferred: Option<NodeId>,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Creation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Creation")
            .field("actor", &self.actor)
            .field("generation", &self.generation)
            .field("set", &self.set)
            .finish_non_exhaustive()
    }
}

/// What happened to an invocation
#[derive(Debug)]
pub(crate) enum Invocation {
    /// Sent to the live worker
    Delivered,
    /// Held until the actor is bound
    Buffered,
    /// The actor is killed; the caller seals the result
    Rejected { call: PendingCall, reason: String },
}

/// What the scheduler has to do after an exit or kill
#[derive(Debug)]
pub(crate) enum ExitAction {
    /// Stale or redundant report
    Ignore,
    Restart {
        old: Option<ActorBinding>,
        creation: Creation,
    },
    Killed {
        old: Option<ActorBinding>,
        failed: Vec<PendingCall>,
        reason: String,
    },
}

struct ActorRecord {
    class: String,
    factory: ActorFactory,
    args: Vec<Value>,
    set: ResourceSet,
    depth: u32,
    preferred: Option<NodeId>,
    state: ActorState,
    restarts: u32,
    max_restarts: u32,
    generation: u64,
    binding: Option<ActorBinding>,
    pending: VecDeque<PendingCall>,
    creation: CancellationToken,
}

impl ActorRecord {
    fn creation(&self, actor: ActorId) -> Creation {
        Creation {
            actor,
            generation: self.generation,
            factory: self.factory.clone(),
            args: self.args.clone(),
            set: self.set.clone(),
            depth: self.depth,
            preferred: self.preferred.clone(),
            cancel: self.creation.clone(),
        }
    }

    /// The single transition every exit goes through
    fn transition(&mut self, actor: ActorId, reason: &ExitReason) -> ExitAction {
        let old = self.binding.take();
        if let Some(binding) = &old {
            binding.cancel.cancel();
        }

        if self.restarts < self.max_restarts {
            self.restarts += 1;
            self.generation += 1;
            self.state = ActorState::Restarting;
            // A construction still queued or running belongs to the old
            // generation
            self.creation.cancel();
            self.creation = CancellationToken::new();
            info!(
                actor = %actor,
                class = %self.class,
                restarts = self.restarts,
                max_restarts = self.max_restarts,
                %reason,
                "restarting actor"
            );
            ExitAction::Restart {
                old,
                creation: self.creation(actor),
            }
        } else {
            warn!(
                actor = %actor,
                class = %self.class,
                restarts = self.restarts,
                %reason,
                "actor out of restarts, killed"
            );
            self.kill(old, format!("actor {reason}, restart budget exhausted"))
        }
    }

    fn kill(&mut self, old: Option<ActorBinding>, reason: String) -> ExitAction {
        self.state = ActorState::Killed;
        self.creation.cancel();
        if let Some(binding) = &old {
            binding.cancel.cancel();
        }
        ExitAction::Killed {
            old,
            failed: self.pending.drain(..).collect(),
            reason,
        }
    }
}

/// Tracks every actor's lifecycle
#[derive(Default)]
pub(crate) struct ActorSupervisor {
    actors: Mutex<HashMap<ActorId, ActorRecord>>,
}

impl ActorSupervisor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a new actor in `Starting` and return its first creation
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register(
        &self,
        actor: ActorId,
        class: &str,
        factory: ActorFactory,
        args: Vec<Value>,
        set: ResourceSet,
        max_restarts: u32,
        depth: u32,
        preferred: Option<NodeId>,
    ) -> Creation {
        let record = ActorRecord {
            class: class.to_string(),
            factory,
            args,
            set,
            depth,
            preferred,
            state: ActorState::Starting,
            restarts: 0,
            max_restarts,
            generation: 0,
            binding: None,
            pending: VecDeque::new(),
            creation: CancellationToken::new(),
        };
        let creation = record.creation(actor);
        self.actors.lock().insert(actor, record);
        debug!(actor = %actor, class, max_restarts, "actor registered");
        creation
    }

    /// Route a call: deliver to the live binding, buffer, or reject
    ///
    /// `deliver` runs under the supervisor lock so calls reach the worker
    /// mailbox in invocation order.
    pub(crate) fn invoke<F>(
        &self,
        actor: ActorId,
        call: PendingCall,
        deliver: F,
    ) -> Result<Invocation, SchedulerError>
    where
        F: FnOnce(&ActorBinding, PendingCall),
    {
        let mut actors = self.actors.lock();
        let record = actors
            .get_mut(&actor)
            .ok_or(SchedulerError::UnknownActor(actor))?;

        match (record.state, &record.binding) {
            (ActorState::Alive, Some(binding)) => {
                deliver(binding, call);
                Ok(Invocation::Delivered)
            }
            (ActorState::Killed, _) => Ok(Invocation::Rejected {
                call,
                reason: "actor is killed".to_string(),
            }),
            _ => {
                record.pending.push_back(call);
                Ok(Invocation::Buffered)
            }
        }
    }

    /// Attach a freshly constructed instance and flush buffered calls
    ///
    /// Returns the binding back when it is stale (the actor was killed or
    /// moved on to a newer generation meanwhile); the caller retires it.
    pub(crate) fn bind<F>(
        &self,
        actor: ActorId,
        binding: ActorBinding,
        mut deliver: F,
    ) -> Result<(), ActorBinding>
    where
        F: FnMut(&ActorBinding, PendingCall),
    {
        let mut actors = self.actors.lock();
        let Some(record) = actors.get_mut(&actor) else {
            return Err(binding);
        };
        let expecting = matches!(record.state, ActorState::Starting | ActorState::Restarting);
        if !expecting || record.generation != binding.generation {
            return Err(binding);
        }

        while let Some(call) = record.pending.pop_front() {
            deliver(&binding, call);
        }
        debug!(
            actor = %actor,
            generation = binding.generation,
            worker = %binding.worker.id(),
            node = %binding.worker.node(),
            "actor bound"
        );
        record.state = ActorState::Alive;
        record.binding = Some(binding);
        Ok(())
    }

    /// Report that a generation's worker went away
    pub(crate) fn on_exit(&self, actor: ActorId, generation: u64, reason: ExitReason) -> ExitAction {
        let mut actors = self.actors.lock();
        let Some(record) = actors.get_mut(&actor) else {
            return ExitAction::Ignore;
        };
        if record.state == ActorState::Killed || record.generation != generation {
            return ExitAction::Ignore;
        }
        record.transition(actor, &reason)
    }

    /// The constructor returned an application error; never restarted
    pub(crate) fn creation_failed(&self, actor: ActorId, generation: u64, message: &str) -> ExitAction {
        let mut actors = self.actors.lock();
        let Some(record) = actors.get_mut(&actor) else {
            return ExitAction::Ignore;
        };
        if record.state == ActorState::Killed || record.generation != generation {
            return ExitAction::Ignore;
        }
        warn!(actor = %actor, class = %record.class, error = message, "actor constructor failed");
        let old = record.binding.take();
        record.kill(old, format!("constructor failed: {message}"))
    }

    /// Kill an actor
    ///
    /// With `no_restart` the actor is killed for good. Otherwise the kill goes
    /// through the same transition as a crash, whether the actor is live or
    /// still being constructed; an in-flight construction is cancelled.
    pub(crate) fn kill(&self, actor: ActorId, no_restart: bool) -> Result<ExitAction, SchedulerError> {
        let mut actors = self.actors.lock();
        let record = actors
            .get_mut(&actor)
            .ok_or(SchedulerError::UnknownActor(actor))?;

        let action = match (record.state, no_restart) {
            (ActorState::Killed, _) => ExitAction::Ignore,
            (_, true) => {
                info!(actor = %actor, class = %record.class, "actor killed");
                let old = record.binding.take();
                record.kill(old, "actor was killed".to_string())
            }
            (ActorState::Alive | ActorState::Starting | ActorState::Restarting, false) => {
                record.transition(actor, &ExitReason::ExternalKill)
            }
        };
        Ok(action)
    }

    pub(crate) fn state(&self, actor: ActorId) -> Option<ActorState> {
        self.actors.lock().get(&actor).map(|r| r.state)
    }

    pub(crate) fn restart_count(&self, actor: ActorId) -> Option<u32> {
        self.actors.lock().get(&actor).map(|r| r.restarts)
    }

    /// Kill every actor, for shutdown
    pub(crate) fn kill_all(&self) -> Vec<(ActorId, ExitAction)> {
        let mut actors = self.actors.lock();
        actors
            .iter_mut()
            .filter(|(_, r)| r.state != ActorState::Killed)
            .map(|(id, r)| {
                let old = r.binding.take();
                (*id, r.kill(old, "scheduler shut down".to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::actor::{Actor, ActorRegistry};
    use crate::error::TaskFailure;
    use crate::ids::ObjectId;
    use crate::resources::{Quantity, ResourceLedger};
    use crate::task::TaskContext;
    use crate::worker::{WorkerPool, WorkerPoolConfig};

    struct Noop;

    #[async_trait::async_trait]
    impl Actor for Noop {
        async fn call(
            &mut self,
            _ctx: &TaskContext,
            _method: &str,
            _args: Vec<Value>,
        ) -> Result<Value, TaskFailure> {
            Ok(Value::Null)
        }
    }

    struct Fixture {
        supervisor: ActorSupervisor,
        pool: WorkerPool,
        ledger: Arc<ResourceLedger>,
        node: NodeId,
        factory: ActorFactory,
    }

    impl Fixture {
        fn new() -> Self {
            let ledger = Arc::new(ResourceLedger::new());
            let node = NodeId::new("node-0");
            ledger
                .add_node(
                    node.clone(),
                    ResourceSet::new().with("CPU", Quantity::from_f64(1.0).unwrap()),
                )
                .unwrap();
            let registry = ActorRegistry::new();
            registry.register("Noop", |_| Ok(Noop));
            Self {
                supervisor: ActorSupervisor::new(),
                pool: WorkerPool::new(WorkerPoolConfig::default()),
                ledger,
                node,
                factory: registry.get("Noop").unwrap(),
            }
        }

        fn register(&self, max_restarts: u32) -> (ActorId, Creation) {
            let id = ActorId::new();
            let creation = self.supervisor.register(
                id,
                "Noop",
                self.factory.clone(),
                Vec::new(),
                ResourceSet::new().with("CPU", Quantity::from_f64(0.5).unwrap()),
                max_restarts,
                1,
                None,
            );
            (id, creation)
        }

        fn binding(&self, generation: u64) -> ActorBinding {
            ActorBinding {
                worker: self.pool.acquire_dedicated(&self.node),
                lease: self
                    .ledger
                    .reserve_any(None, &ResourceSet::new().with("CPU", Quantity::from_f64(0.5).unwrap()))
                    .unwrap(),
                cancel: CancellationToken::new(),
                generation,
            }
        }
    }

    fn call(method: &str) -> PendingCall {
        PendingCall {
            result: ObjectRef::new(ObjectId::new(), None),
            method: method.to_string(),
            args: Vec::new(),
            depth: 1,
        }
    }

    #[tokio::test]
    async fn test_calls_buffer_until_bound_then_flush_in_order() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(0);

        for m in ["a", "b", "c"] {
            let invocation = fx.supervisor.invoke(id, call(m), |_, _| panic!("not bound")).unwrap();
            assert!(matches!(invocation, Invocation::Buffered));
        }

        let mut delivered = Vec::new();
        fx.supervisor
            .bind(id, fx.binding(creation.generation), |_, c| delivered.push(c.method))
            .unwrap();
        assert_eq!(delivered, vec!["a", "b", "c"]);
        assert_eq!(fx.supervisor.state(id), Some(ActorState::Alive));

        let invocation = fx.supervisor.invoke(id, call("d"), |_, _| {}).unwrap();
        assert!(matches!(invocation, Invocation::Delivered));
    }

    #[tokio::test]
    async fn test_restart_budget_is_bounded() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(2);
        let mut generation = creation.generation;
        fx.supervisor.bind(id, fx.binding(generation), |_, _| {}).unwrap();

        for expected in 1..=2 {
            match fx.supervisor.on_exit(id, generation, ExitReason::Crash("boom".into())) {
                ExitAction::Restart { old, creation } => {
                    assert!(old.is_some());
                    generation = creation.generation;
                }
                other => panic!("expected restart, got {other:?}"),
            }
            assert_eq!(fx.supervisor.restart_count(id), Some(expected));
            assert_eq!(fx.supervisor.state(id), Some(ActorState::Restarting));
            fx.supervisor.bind(id, fx.binding(generation), |_, _| {}).unwrap();
        }

        let action = fx.supervisor.on_exit(id, generation, ExitReason::SelfExit);
        assert!(matches!(action, ExitAction::Killed { .. }));
        assert_eq!(fx.supervisor.restart_count(id), Some(2));
        assert_eq!(fx.supervisor.state(id), Some(ActorState::Killed));

        let invocation = fx.supervisor.invoke(id, call("x"), |_, _| {}).unwrap();
        assert!(matches!(invocation, Invocation::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_stale_exit_reports_are_ignored() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(1);
        fx.supervisor.bind(id, fx.binding(creation.generation), |_, _| {}).unwrap();

        let action = fx.supervisor.on_exit(id, creation.generation, ExitReason::Crash("x".into()));
        assert!(matches!(action, ExitAction::Restart { .. }));

        // A second report for the old generation changes nothing
        let action = fx.supervisor.on_exit(id, creation.generation, ExitReason::Crash("x".into()));
        assert!(matches!(action, ExitAction::Ignore));
        assert_eq!(fx.supervisor.restart_count(id), Some(1));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(3);
        fx.supervisor.bind(id, fx.binding(creation.generation), |_, _| {}).unwrap();
        fx.supervisor.invoke(id, call("queued"), |_, _| {}).unwrap();

        let action = fx.supervisor.kill(id, true).unwrap();
        assert!(matches!(action, ExitAction::Killed { old: Some(_), .. }));
        assert!(matches!(fx.supervisor.kill(id, true).unwrap(), ExitAction::Ignore));
        assert!(matches!(fx.supervisor.kill(id, false).unwrap(), ExitAction::Ignore));
        assert_eq!(fx.supervisor.restart_count(id), Some(0));
    }

    #[tokio::test]
    async fn test_kill_no_restart_fails_buffered_calls_and_cancels_creation() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(3);
        fx.supervisor.invoke(id, call("a"), |_, _| {}).unwrap();
        fx.supervisor.invoke(id, call("b"), |_, _| {}).unwrap();

        match fx.supervisor.kill(id, true).unwrap() {
            ExitAction::Killed { old, failed, .. } => {
                assert!(old.is_none());
                assert_eq!(failed.len(), 2);
            }
            other => panic!("expected kill, got {other:?}"),
        }
        assert!(creation.cancel.is_cancelled());

        // The in-flight creation finishing late is handed back
        assert!(fx
            .supervisor
            .bind(id, fx.binding(creation.generation), |_, _| {})
            .is_err());
    }

    #[tokio::test]
    async fn test_soft_kill_while_starting_restarts_construction() {
        let fx = Fixture::new();
        let (id, first) = fx.register(1);
        fx.supervisor.invoke(id, call("queued"), |_, _| {}).unwrap();

        let second = match fx.supervisor.kill(id, false).unwrap() {
            ExitAction::Restart { old, creation } => {
                assert!(old.is_none());
                creation
            }
            other => panic!("expected restart, got {other:?}"),
        };
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(fx.supervisor.restart_count(id), Some(1));
        assert_eq!(fx.supervisor.state(id), Some(ActorState::Restarting));

        // The superseded construction cannot bind
        assert!(fx.supervisor.bind(id, fx.binding(first.generation), |_, _| {}).is_err());

        // Out of budget: the next kill is permanent and fails the buffered call
        match fx.supervisor.kill(id, false).unwrap() {
            ExitAction::Killed { old, failed, .. } => {
                assert!(old.is_none());
                assert_eq!(failed.len(), 1);
            }
            other => panic!("expected kill, got {other:?}"),
        }
        assert!(second.cancel.is_cancelled());
        assert_eq!(fx.supervisor.state(id), Some(ActorState::Killed));
    }

    #[tokio::test]
    async fn test_soft_kill_counts_against_budget() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(1);
        fx.supervisor.bind(id, fx.binding(creation.generation), |_, _| {}).unwrap();

        let action = fx.supervisor.kill(id, false).unwrap();
        assert!(matches!(action, ExitAction::Restart { .. }));
        assert_eq!(fx.supervisor.restart_count(id), Some(1));
    }

    #[tokio::test]
    async fn test_constructor_error_kills_permanently() {
        let fx = Fixture::new();
        let (id, creation) = fx.register(5);
        let action = fx.supervisor.creation_failed(id, creation.generation, "bad config");
        assert!(matches!(action, ExitAction::Killed { .. }));
        assert_eq!(fx.supervisor.state(id), Some(ActorState::Killed));
    }

    #[test]
    fn test_unknown_actor() {
        let supervisor = ActorSupervisor::new();
        let id = ActorId::new();
        assert_eq!(
            supervisor.kill(id, true).unwrap_err(),
            SchedulerError::UnknownActor(id)
        );
    }
}

//! Admission ticks and execution of admitted work

use std::future::Future;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::engine::{PendingTask, PendingWork, Scheduler};
use crate::actor::{ActorBinding, Creation, ExitAction, ExitReason, PendingCall};
use crate::error::{abort_on_invariant_violation, FailureCause, TaskError, TaskFailure};
use crate::ids::{ActorId, LeaseId, WorkerId};
use crate::object::ObjectRef;
use crate::queue::{Decision, LaneKey, QueueEntry};
use crate::resources::{LeaseGuard, LedgerError, Quantity, ResourceSet, CPU};
use crate::task::{ContextScope, TaskContext};
use crate::worker::{ExecutionOutcome, ReleaseKind, WorkerCommand, WorkerPool};

/// Keeps a worker marked blocked until dropped
struct BlockGuard<'a> {
    pool: &'a WorkerPool,
    worker: WorkerId,
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.pool.mark_unblocked(self.worker);
    }
}

impl Scheduler {
    /// Run one admission tick
    ///
    /// Offers queued work to the ledger under the queue lock, then launches
    /// whatever was admitted after the lock is released.
    pub(crate) fn schedule(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let tick = {
            let mut queue = self.inner.queue.lock();
            if queue.is_empty() {
                return;
            }
            queue.schedule(Instant::now(), |entry| self.decide(entry))
        };
        self.inner.rounds.fetch_add(1, Ordering::Relaxed);
        if tick.is_empty() {
            return;
        }
        trace!(
            admitted = tick.admitted.len(),
            expired = tick.expired.len(),
            dropped = tick.dropped.len(),
            "scheduling tick"
        );

        for (entry, lease) in tick.admitted {
            match entry.item {
                PendingWork::Task(task) => {
                    if let Some(lease) = lease {
                        tokio::spawn(self.clone().run_task(task, lease));
                    }
                }
                PendingWork::Actor(creation) => {
                    if let Some(lease) = lease {
                        tokio::spawn(self.clone().start_actor(creation, lease));
                    }
                }
                PendingWork::Resume { lease, reply } => {
                    if reply.send(()).is_err() {
                        // The blocked caller went away after the share was
                        // taken back; return it.
                        self.suspend(lease);
                    }
                }
            }
        }

        for entry in tick.expired {
            if let PendingWork::Task(task) = entry.item {
                let waited_ms = entry.enqueued_at.elapsed().as_millis() as u64;
                warn!(task = %task.task_id, function = %task.function_name, waited_ms, "admission timed out");
                self.finish_task(task.task_id, Err(TaskError::AdmissionTimeout { waited_ms }));
            }
        }

        for entry in tick.dropped {
            if let PendingWork::Task(task) = entry.item {
                self.finish_task(task.task_id, Err(TaskError::Cancelled));
            }
        }
    }

    fn decide(&self, entry: &QueueEntry<PendingWork>) -> Decision<Option<LeaseGuard>> {
        let ledger = &self.inner.ledger;
        match &entry.item {
            PendingWork::Task(task) => {
                if task.cancel.is_cancelled() {
                    return Decision::Drop;
                }
                match ledger.reserve_any(task.preferred.as_ref(), &task.set) {
                    Some(lease) => Decision::Admit(Some(lease)),
                    None => Decision::Retain,
                }
            }
            PendingWork::Actor(creation) => {
                if creation.cancel.is_cancelled() {
                    return Decision::Drop;
                }
                match ledger.reserve_any(creation.preferred.as_ref(), &creation.set) {
                    Some(lease) => Decision::Admit(Some(lease)),
                    None => Decision::Retain,
                }
            }
            PendingWork::Resume { lease, reply } => {
                if reply.is_closed() {
                    return Decision::Drop;
                }
                match ledger.try_resume_cpu(*lease) {
                    Ok(true) => Decision::Admit(None),
                    Ok(false) => Decision::Retain,
                    Err(LedgerError::InvariantViolation(message)) => {
                        abort_on_invariant_violation(&message)
                    }
                    Err(_) => Decision::Drop,
                }
            }
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    #[instrument(skip_all, fields(task = %task.task_id, function = %task.function_name, attempt = task.attempt))]
    async fn run_task(self, task: PendingTask, lease: LeaseGuard) {
        let inner = &self.inner;
        let node = lease.node().clone();

        let worker = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => {
                drop(lease);
                self.finish_task(task.task_id, Err(TaskError::Cancelled));
                return;
            }
            worker = inner.pool.acquire(&node, task.max_calls) => worker,
        };
        debug!(worker = %worker.id(), %node, lease = %lease.id(), "task started");

        let ctx = self.context(
            Some(task.task_id),
            None,
            worker.id(),
            node,
            task.depth,
            Some(lease.id()),
            task.attempt,
        );
        let (reply, outcome) = oneshot::channel();
        let command = WorkerCommand::RunTask {
            function: task.function.clone(),
            ctx,
            args: task.args.clone(),
            cancel: task.cancel.clone(),
            reply,
        };
        let outcome = match worker.send(command) {
            Ok(()) => outcome
                .await
                .unwrap_or_else(|_| ExecutionOutcome::Crashed("worker exited mid-task".into())),
            Err(_) => ExecutionOutcome::Crashed("worker mailbox closed".into()),
        };

        let release = match &outcome {
            ExecutionOutcome::Finished(_) => ReleaseKind::Completed,
            ExecutionOutcome::Crashed(_) => ReleaseKind::Crashed,
            ExecutionOutcome::Cancelled => ReleaseKind::Cancelled,
        };
        let worker_id = worker.id();
        inner.pool.release(worker, release);
        if !outcome.worker_survives() {
            // Children are cancelled while the lease still blocks their admission
            self.cancel_orphans(worker_id);
        }
        // Resources are back before anyone can observe the result
        drop(lease);

        let attempts = task.attempt;
        match outcome {
            ExecutionOutcome::Finished(Ok(value)) => self.finish_task(task.task_id, Ok(value)),
            ExecutionOutcome::Finished(Err(TaskFailure::Application(message))) => self.finish_task(
                task.task_id,
                Err(TaskError::TaskFailed {
                    attempts,
                    cause: FailureCause::Application(message),
                }),
            ),
            ExecutionOutcome::Finished(Err(TaskFailure::Upstream(upstream))) => self.finish_task(
                task.task_id,
                Err(TaskError::TaskFailed {
                    attempts,
                    cause: FailureCause::Upstream(Box::new(upstream)),
                }),
            ),
            ExecutionOutcome::Crashed(message)
            | ExecutionOutcome::Finished(Err(TaskFailure::Crash(message))) => {
                self.retry_or_fail(task, message).await
            }
            ExecutionOutcome::Cancelled => self.finish_task(task.task_id, Err(TaskError::Cancelled)),
        }
    }

    async fn retry_or_fail(&self, mut task: PendingTask, message: String) {
        if task.attempt > task.max_retries {
            warn!(task = %task.task_id, attempts = task.attempt, error = %message, "task failed permanently after worker crashes");
            self.finish_task(
                task.task_id,
                Err(TaskError::TaskFailed {
                    attempts: task.attempt,
                    cause: FailureCause::WorkerCrashed(message),
                }),
            );
            return;
        }

        let delay = self.inner.config.retry.delay_for_retry(task.attempt);
        warn!(
            task = %task.task_id,
            attempt = task.attempt,
            max_retries = task.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "worker crashed, retrying task"
        );
        tokio::select! {
            biased;
            _ = task.cancel.cancelled() => {
                self.finish_task(task.task_id, Err(TaskError::Cancelled));
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        task.attempt += 1;
        self.enqueue(task);
        self.schedule();
    }

    // =========================================================================
    // Actors
    // =========================================================================

    #[instrument(skip_all, fields(actor = %creation.actor, generation = creation.generation))]
    async fn start_actor(self, creation: Creation, lease: LeaseGuard) {
        let inner = &self.inner;
        let worker = inner.pool.acquire_dedicated(lease.node());
        let (reply, started) = oneshot::channel();
        let command = WorkerCommand::StartActor {
            factory: creation.factory.clone(),
            args: creation.args.clone(),
            reply,
        };

        let result = match worker.send(command) {
            Ok(()) => tokio::select! {
                biased;
                _ = creation.cancel.cancelled() => {
                    debug!("actor creation cancelled");
                    inner.pool.retire(worker.id());
                    return;
                }
                result = started => result.unwrap_or_else(|_| {
                    Err(TaskFailure::Crash("worker exited during construction".into()))
                }),
            },
            Err(_) => Err(TaskFailure::Crash("worker mailbox closed".into())),
        };

        let actor = creation.actor;
        match result {
            Ok(()) => {
                let binding = ActorBinding {
                    worker,
                    lease,
                    cancel: inner.shutdown.child_token(),
                    generation: creation.generation,
                };
                let bound = inner
                    .supervisor
                    .bind(actor, binding, |binding, call| self.deliver(actor, binding, call));
                if let Err(stale) = bound {
                    debug!("actor binding is stale, retiring worker");
                    self.discard_binding(stale);
                }
            }
            Err(failure) => {
                inner.pool.retire(worker.id());
                drop(lease);
                let action = match failure {
                    TaskFailure::Crash(message) => {
                        inner
                            .supervisor
                            .on_exit(actor, creation.generation, ExitReason::Crash(message))
                    }
                    TaskFailure::Application(message) => {
                        inner
                            .supervisor
                            .creation_failed(actor, creation.generation, &message)
                    }
                    TaskFailure::Upstream(upstream) => inner.supervisor.creation_failed(
                        actor,
                        creation.generation,
                        &upstream.to_string(),
                    ),
                };
                self.apply_exit(actor, action);
            }
        }
    }

    /// Hand a call to a live binding; runs under the supervisor lock
    pub(crate) fn deliver(&self, actor: ActorId, binding: &ActorBinding, call: PendingCall) {
        let ctx = self.context(
            None,
            Some(actor),
            binding.worker.id(),
            binding.worker.node().clone(),
            call.depth,
            None,
            1,
        );
        let (reply, outcome) = oneshot::channel();
        let command = WorkerCommand::CallActor {
            ctx: ctx.clone(),
            method: call.method,
            args: call.args,
            cancel: binding.cancel.clone(),
            reply,
        };
        let outcome = binding.worker.send(command).ok().map(|()| outcome);
        tokio::spawn(
            self.clone()
                .watch_call(actor, binding.generation, call.result, ctx, outcome),
        );
    }

    /// Seal one actor call and feed crashes and self-exits to the supervisor
    async fn watch_call(
        self,
        actor: ActorId,
        generation: u64,
        result: ObjectRef,
        ctx: TaskContext,
        outcome: Option<oneshot::Receiver<ExecutionOutcome>>,
    ) {
        let outcome = match outcome {
            Some(rx) => rx.await.ok(),
            None => None,
        };

        let sealed = match outcome {
            Some(ExecutionOutcome::Finished(finished)) => {
                if ctx.exit_requested() {
                    self.cancel_orphans(ctx.worker_id());
                    let action = self
                        .inner
                        .supervisor
                        .on_exit(actor, generation, ExitReason::SelfExit);
                    self.apply_exit(actor, action);
                    Err(TaskError::actor_unavailable(actor, "actor exited"))
                } else {
                    match finished {
                        Ok(value) => Ok(value),
                        Err(TaskFailure::Upstream(upstream)) => Err(TaskError::TaskFailed {
                            attempts: 1,
                            cause: FailureCause::Upstream(Box::new(upstream)),
                        }),
                        Err(failure) => Err(TaskError::TaskFailed {
                            attempts: 1,
                            cause: FailureCause::Application(failure.to_string()),
                        }),
                    }
                }
            }
            Some(ExecutionOutcome::Crashed(message)) => {
                self.cancel_orphans(ctx.worker_id());
                let reason = format!("actor crashed: {message}");
                let action = self
                    .inner
                    .supervisor
                    .on_exit(actor, generation, ExitReason::Crash(message));
                self.apply_exit(actor, action);
                Err(TaskError::actor_unavailable(actor, reason))
            }
            Some(ExecutionOutcome::Cancelled) | None => Err(TaskError::actor_unavailable(
                actor,
                "actor stopped before the call completed",
            )),
        };
        self.seal(&result, sealed);
    }

    /// Carry out a supervisor decision
    pub(crate) fn apply_exit(&self, actor: ActorId, action: ExitAction) {
        match action {
            ExitAction::Ignore => {}
            ExitAction::Restart { old, creation } => {
                if let Some(binding) = old {
                    self.discard_binding(binding);
                }
                self.enqueue_creation(creation);
                self.schedule();
            }
            ExitAction::Killed {
                old,
                failed,
                reason,
            } => {
                if let Some(binding) = old {
                    self.discard_binding(binding);
                }
                for call in failed {
                    self.seal(
                        &call.result,
                        Err(TaskError::actor_unavailable(actor, reason.clone())),
                    );
                }
            }
        }
    }

    /// Stop a binding's calls, exit its worker and release its lease
    pub(crate) fn discard_binding(&self, binding: ActorBinding) {
        binding.cancel.cancel();
        self.inner.pool.retire(binding.worker.id());
        drop(binding.lease);
    }

    // =========================================================================
    // Blocking
    // =========================================================================

    /// Await `fut` with the caller's CPU share returned to the ledger
    ///
    /// The worker is marked blocked (freeing its active slot) and gets its
    /// CPU back through the resume lane before this returns.
    pub(crate) async fn while_blocked<F: Future>(&self, scope: &ContextScope, fut: F) -> F::Output {
        let suspended = scope.lease.map_or(Quantity::ZERO, |lease| self.suspend(lease));
        self.inner.pool.mark_blocked(scope.worker);
        let _blocked = BlockGuard {
            pool: &self.inner.pool,
            worker: scope.worker,
        };
        if !suspended.is_zero() {
            self.schedule();
        }

        let output = fut.await;

        if let (Some(lease), false) = (scope.lease, suspended.is_zero()) {
            self.resume(lease, suspended).await;
        }
        output
    }

    fn suspend(&self, lease: LeaseId) -> Quantity {
        match self.inner.ledger.suspend_cpu(lease) {
            Ok(amount) => amount,
            Err(LedgerError::InvariantViolation(message)) => abort_on_invariant_violation(&message),
            Err(err) => {
                debug!(%lease, error = %err, "nothing to suspend");
                Quantity::ZERO
            }
        }
    }

    /// Wait in the resume lane until the CPU share is reserved again
    async fn resume(&self, lease: LeaseId, amount: Quantity) {
        let (reply, resumed) = oneshot::channel();
        self.inner.queue.lock().push(
            LaneKey::Resume,
            ResourceSet::new().with(CPU, amount),
            None,
            PendingWork::Resume { lease, reply },
        );
        self.schedule();
        // Dropped only when the lease is gone or the scheduler shut down
        let _ = resumed.await;
    }
}

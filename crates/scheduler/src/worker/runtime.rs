//! Worker event loop
//!
//! A worker is a spawned task draining a command mailbox. It runs one task
//! function or actor method at a time; a panic in user code is caught and
//! reported as a crash, after which the loop exits like a dead process.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::actor::{Actor, ActorFactory};
use crate::error::TaskFailure;
use crate::gc::CollectionReport;
use crate::ids::WorkerId;
use crate::task::{TaskContext, TaskFunction, TaskResult};

/// How one execution ended
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// User code returned
    Finished(TaskResult),
    /// User code panicked or reported a crash; the worker is gone
    Crashed(String),
    /// Cancellation won the race; the worker is gone
    Cancelled,
}

impl ExecutionOutcome {
    /// Whether the worker survives this outcome
    pub fn worker_survives(&self) -> bool {
        matches!(self, ExecutionOutcome::Finished(_))
    }
}

/// Messages a worker understands
pub enum WorkerCommand {
    RunTask {
        function: TaskFunction,
        ctx: TaskContext,
        args: Vec<Value>,
        cancel: CancellationToken,
        reply: oneshot::Sender<ExecutionOutcome>,
    },
    StartActor {
        factory: ActorFactory,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<(), TaskFailure>>,
    },
    CallActor {
        ctx: TaskContext,
        method: String,
        args: Vec<Value>,
        cancel: CancellationToken,
        reply: oneshot::Sender<ExecutionOutcome>,
    },
    Collect {
        reply: oneshot::Sender<CollectionReport>,
    },
    Exit,
}

impl std::fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerCommand::RunTask { .. } => "RunTask",
            WorkerCommand::StartActor { .. } => "StartActor",
            WorkerCommand::CallActor { .. } => "CallActor",
            WorkerCommand::Collect { .. } => "Collect",
            WorkerCommand::Exit => "Exit",
        };
        f.write_str(name)
    }
}

/// Race user code against cancellation, catching panics
pub(crate) async fn execute<F>(fut: F, cancel: &CancellationToken) -> ExecutionOutcome
where
    F: Future<Output = TaskResult>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
        result = AssertUnwindSafe(fut).catch_unwind() => match result {
            Ok(Err(TaskFailure::Crash(message))) => ExecutionOutcome::Crashed(message),
            Ok(result) => ExecutionOutcome::Finished(result),
            Err(panic) => ExecutionOutcome::Crashed(panic_message(panic.as_ref())),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run a worker until it is told to exit, crashes, or its mailbox closes
pub(crate) async fn worker_loop(id: WorkerId, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut actor: Option<Box<dyn Actor>> = None;
    debug!(worker = %id, "worker started");

    while let Some(command) = commands.recv().await {
        trace!(worker = %id, ?command, "worker command");
        match command {
            WorkerCommand::RunTask {
                function,
                ctx,
                args,
                cancel,
                reply,
            } => {
                let outcome = execute(function(ctx, args), &cancel).await;
                let survives = outcome.worker_survives();
                let _ = reply.send(outcome);
                if !survives {
                    break;
                }
            }
            WorkerCommand::StartActor {
                factory,
                args,
                reply,
            } => {
                let built = std::panic::catch_unwind(AssertUnwindSafe(|| factory(args)));
                let result = match built {
                    Ok(Ok(instance)) => {
                        actor = Some(instance);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(panic) => Err(TaskFailure::Crash(panic_message(panic.as_ref()))),
                };
                let failed = result.is_err();
                let _ = reply.send(result);
                if failed {
                    break;
                }
            }
            WorkerCommand::CallActor {
                ctx,
                method,
                args,
                cancel,
                reply,
            } => {
                let outcome = match actor.as_mut() {
                    Some(instance) => execute(instance.call(&ctx, &method, args), &cancel).await,
                    None => ExecutionOutcome::Crashed("no actor instance on worker".to_string()),
                };
                // After a self-exit the instance takes no further calls;
                // whatever is still in the mailbox is dropped unanswered
                let survives = outcome.worker_survives() && !ctx.exit_requested();
                let _ = reply.send(outcome);
                if !survives {
                    debug!(worker = %id, "actor instance stopped");
                    break;
                }
            }
            WorkerCommand::Collect { reply } => {
                let reclaimed = match actor.as_mut() {
                    Some(instance) => AssertUnwindSafe(instance.collect())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            warn!(worker = %id, "collection pass panicked");
                            false
                        }),
                    None => false,
                };
                let _ = reply.send(CollectionReport {
                    worker: id,
                    reclaimed,
                });
            }
            WorkerCommand::Exit => break,
        }
    }

    debug!(worker = %id, "worker exited");
}

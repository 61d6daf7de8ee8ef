//! Error types
//!
//! [`TaskError`] is what callers observe through an [`ObjectRef`]; it is
//! cloneable and serializable because the same failure may be fetched by
//! many holders of the ref. [`TaskFailure`] is what user code returns.
//!
//! [`ObjectRef`]: crate::object::ObjectRef

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::ids::{ActorId, ObjectId};
use crate::resources::LedgerError;

/// Discrete error kinds surfaced to callers
///
/// `ResourceRejected` and `LedgerInvariantViolation` are only ever reported
/// synchronously through [`SchedulerError::kind`]; the rest arrive through
/// object refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceRejected,
    AdmissionTimeout,
    TaskFailed,
    ActorUnavailable,
    Cancelled,
    LedgerInvariantViolation,
}

/// Why a task permanently failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    /// The worker died mid-task on every attempt
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// User code returned an error
    #[error("{0}")]
    Application(String),

    /// An argument or awaited object failed
    #[error("upstream failure: {0}")]
    Upstream(Box<TaskError>),
}

/// Terminal failure delivered through an object ref
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// Queued longer than the caller allowed
    #[error("admission timed out after {waited_ms}ms")]
    AdmissionTimeout { waited_ms: u64 },

    /// Failed permanently, possibly after retries
    #[error("task failed after {attempts} attempt(s): {cause}")]
    TaskFailed { attempts: u32, cause: FailureCause },

    /// Actor killed or out of restarts
    #[error("actor {actor_id} unavailable: {reason}")]
    ActorUnavailable { actor_id: ActorId, reason: String },

    /// Cancelled by the caller
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::AdmissionTimeout { .. } => ErrorKind::AdmissionTimeout,
            TaskError::TaskFailed { .. } => ErrorKind::TaskFailed,
            TaskError::ActorUnavailable { .. } => ErrorKind::ActorUnavailable,
            TaskError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the underlying cause was a worker crash
    pub fn is_worker_crash(&self) -> bool {
        matches!(
            self,
            TaskError::TaskFailed {
                cause: FailureCause::WorkerCrashed(_),
                ..
            }
        )
    }

    pub(crate) fn actor_unavailable(actor_id: ActorId, reason: impl Into<String>) -> Self {
        TaskError::ActorUnavailable {
            actor_id,
            reason: reason.into(),
        }
    }
}

/// Error returned by user task functions and actor methods
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    /// Ordinary application error; not retried
    #[error("{0}")]
    Application(String),

    /// Simulated process death; retried like a panic
    #[error("worker crashed: {0}")]
    Crash(String),

    /// A dependency failed
    #[error(transparent)]
    Upstream(TaskError),
}

impl TaskFailure {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        TaskFailure::Application(message.to_string())
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(err: anyhow::Error) -> Self {
        TaskFailure::Application(format!("{err:#}"))
    }
}

impl From<TaskError> for TaskFailure {
    fn from(err: TaskError) -> Self {
        TaskFailure::Upstream(err)
    }
}

impl From<StoreError> for TaskFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Failed(e) => TaskFailure::Upstream(e),
            other => TaskFailure::Application(other.to_string()),
        }
    }
}

impl From<SchedulerError> for TaskFailure {
    fn from(err: SchedulerError) -> Self {
        TaskFailure::Application(err.to_string())
    }
}

impl From<serde_json::Error> for TaskFailure {
    fn from(err: serde_json::Error) -> Self {
        TaskFailure::Application(format!("serialization error: {err}"))
    }
}

/// Object store errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Object id was never created or has been freed
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Object was already sealed
    #[error("object already sealed: {0}")]
    AlreadySealed(ObjectId),

    /// The producing task failed
    #[error(transparent)]
    Failed(TaskError),
}

impl StoreError {
    /// Terminal task error behind this failure, if any
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            StoreError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Scheduler errors returned synchronously from submission calls
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// Request can never be satisfied (fatal, not retried)
    #[error("resource request rejected: {0}")]
    ResourceRejected(String),

    #[error("no function registered with name: {0}")]
    UnknownFunction(String),

    #[error("no actor class registered with name: {0}")]
    UnknownActorClass(String),

    #[error("unknown actor: {0}")]
    UnknownActor(ActorId),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SchedulerError::ResourceRejected(_) => Some(ErrorKind::ResourceRejected),
            SchedulerError::Ledger(LedgerError::InvariantViolation(_)) => {
                Some(ErrorKind::LedgerInvariantViolation)
            }
            SchedulerError::Store(StoreError::Failed(e)) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Log and abort; the ledger is never silently corrected
pub(crate) fn abort_on_invariant_violation(message: &str) -> ! {
    error!(detail = message, "resource ledger invariant violated, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = TaskError::TaskFailed {
            attempts: 3,
            cause: FailureCause::WorkerCrashed("killed".into()),
        };
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert!(err.is_worker_crash());
        assert_eq!(TaskError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_synchronous_kinds() {
        let err = SchedulerError::ResourceRejected("CPU: 4 exceeds every node".into());
        assert_eq!(err.kind(), Some(ErrorKind::ResourceRejected));
        let err = SchedulerError::Ledger(LedgerError::InvariantViolation("negative".into()));
        assert_eq!(err.kind(), Some(ErrorKind::LedgerInvariantViolation));
        assert_eq!(SchedulerError::ShuttingDown.kind(), None);
    }

    #[test]
    fn test_task_error_serialization() {
        let err = TaskError::AdmissionTimeout { waited_ms: 250 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "admission_timeout");
        assert_eq!(json["waited_ms"], 250);

        let parsed: TaskError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_failure_conversions() {
        let failure: TaskFailure = anyhow::anyhow!("boom").into();
        assert!(matches!(failure, TaskFailure::Application(ref m) if m == "boom"));

        let failure: TaskFailure = StoreError::Failed(TaskError::Cancelled).into();
        assert!(matches!(failure, TaskFailure::Upstream(TaskError::Cancelled)));
    }

    #[test]
    fn test_display() {
        let err = TaskError::TaskFailed {
            attempts: 2,
            cause: FailureCause::Application("bad input".into()),
        };
        assert_eq!(err.to_string(), "task failed after 2 attempt(s): bad input");
    }
}

//! # Tessera Scheduler
//!
//! Task-and-actor scheduling core: admission control over fractional
//! resources, fair queueing of recursively submitted work, worker recycling,
//! actor supervision, and a debounced garbage collection trigger.
//!
//! ## Features
//!
//! - **Resource ledger**: fixed-point quantities, all-or-nothing leases released on drop
//! - **Fair queue**: one lane per call depth, served round-robin, so nested work is never starved
//! - **Worker pool**: reuse with `max_calls` recycling; a draining worker waits for its children
//! - **Actor supervision**: bounded restarts, buffered calls while (re)starting, idempotent kill
//! - **GC trigger**: edge-triggered broadcast with hysteresis and coalescing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Scheduler                            │
//! │  (submission, argument resolution, cancellation, retries)   │
//! └─────────────────────────────────────────────────────────────┘
//!            │                   │                    │
//!            ▼                   ▼                    ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │    FairQueue     │ │  ResourceLedger  │ │ ActorSupervisor  │
//! │ (depth lanes)    │ │ (leases)         │ │ (restart budget) │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (worker event loops, max_calls draining, GC broadcast)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use tessera_scheduler::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let scheduler = Scheduler::new(SchedulerConfig::single_node(2.0)).unwrap();
//!
//! scheduler.register_function("leaf", |_ctx, args| async move {
//!     Ok(json!(args[0].as_i64().unwrap_or(0) + 1))
//! });
//! scheduler.register_function("parent", |ctx, args| async move {
//!     let child = ctx.submit_task(TaskDescriptor::new("leaf").with_args(args))?;
//!     Ok(ctx.get(&child).await?)
//! });
//!
//! let result = scheduler
//!     .submit_task(TaskDescriptor::new("parent").with_arg(json!(41)))
//!     .unwrap();
//! assert_eq!(scheduler.get(&result).await.unwrap(), json!(42));
//! scheduler.shutdown();
//! # });
//! ```

pub mod actor;
pub mod error;
pub mod gc;
pub mod ids;
pub mod object;
pub mod queue;
pub mod reliability;
pub mod resources;
pub mod scheduler;
pub mod task;
pub mod worker;

mod duration_serde;

/// Prelude for common imports
pub mod prelude {
    pub use crate::actor::{Actor, ActorHandle, ActorSpec, ActorState};
    pub use crate::error::{ErrorKind, FailureCause, SchedulerError, StoreError, TaskError, TaskFailure};
    pub use crate::gc::GcConfig;
    pub use crate::ids::{ActorId, NodeId, TaskId};
    pub use crate::object::{ObjectRef, ObjectStore, WaitResult};
    pub use crate::reliability::RetryPolicy;
    pub use crate::resources::ResourceRequest;
    pub use crate::scheduler::{NodeConfig, Scheduler, SchedulerConfig};
    pub use crate::task::{TaskArg, TaskContext, TaskDescriptor};
    pub use crate::worker::WorkerPoolConfig;
}

// Re-export key types at crate root
pub use actor::{Actor, ActorHandle, ActorSpec, ActorState};
pub use error::{ErrorKind, SchedulerError, StoreError, TaskError, TaskFailure};
pub use object::{InMemoryObjectStore, ObjectRef, ObjectStore};
pub use resources::ResourceRequest;
pub use scheduler::{NodeConfig, Scheduler, SchedulerConfig};
pub use task::{TaskContext, TaskDescriptor};

//! Workers and the pool that owns them
//!
//! ```text
//!   Scheduler ──acquire──▶ WorkerPool ──spawn──▶ worker_loop (tokio task)
//!       │                      │                     ▲
//!       │                      │ idle list / max_calls │ WorkerCommand
//!       └──── WorkerHandle ────┴─────────────────────┘
//! ```
//!
//! A worker behaves like a process: it outlives the tasks it runs, a crash
//! takes it down, and an actor gets a worker of its own.

mod pool;
mod runtime;

pub use pool::{
    PoolSnapshot, ReleaseKind, WorkerHandle, WorkerInfo, WorkerKind, WorkerPool, WorkerPoolConfig,
    WorkerState,
};
pub use runtime::{ExecutionOutcome, WorkerCommand};

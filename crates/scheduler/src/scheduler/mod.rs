//! The scheduler: admission, execution and supervision wired together
//!
//! ```text
//!                 ┌──────────────────────── Scheduler ────────────────────────┐
//!  submit_task ──▶│ FairQueue ──▶ ResourceLedger ──▶ WorkerPool ──▶ worker    │
//!  create_actor ─▶│     ▲              │                               │      │
//!  actor calls ──▶│ ActorSupervisor ◀──┴── exits ◀─────────────────────┘      │
//!                 │ GcCoordinator ◀── memory samples on every sealed result   │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

mod config;
mod dispatch;
mod engine;

pub use config::{NodeConfig, SchedulerConfig};
pub use engine::Scheduler;

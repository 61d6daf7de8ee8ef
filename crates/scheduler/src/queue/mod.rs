//! Admission ordering
//!
//! ```text
//!   Resume lane ──────────────┐   (always first)
//!   depth-0 [f1 f2 f3 ...]    │
//!   depth-1 [g1 ...]        ──┼──▶ least-recently-served lane ──▶ ledger
//!   depth-2 [h1 ...]          │    (ties: deeper lane)
//!                           ──┘
//! ```
//!
//! Recursive chains such as `f → g → h` put each level in its own lane, so a
//! flood of new top-level work can never starve the children that existing
//! work is waiting on.

mod fair;

pub use fair::{Decision, EntryId, FairQueue, LaneKey, QueueEntry, ShapeLoad, Tick};

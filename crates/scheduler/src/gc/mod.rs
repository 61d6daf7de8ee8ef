//! Garbage collection trigger
//!
//! ```text
//!  object store bytes ─┐
//!  worker heap bytes ──┼─▶ GcCoordinator::observe ──(edge)──▶ Collect ─▶ every live worker
//!  external reports ───┘        │                                     │
//!                               └──── history ◀── CollectionReport ◀──┘
//! ```
//!
//! The coordinator owns only the trigger policy. What a collection pass does
//! is up to each worker: actor instances run [`Actor::collect`], stateless
//! task workers report nothing reclaimed.
//!
//! [`Actor::collect`]: crate::actor::Actor::collect

mod coordinator;

pub use coordinator::{
    CollectionReport, CollectionRound, CollectionTarget, GcConfig, GcCoordinator, MemoryUsage,
    TriggerDecision,
};

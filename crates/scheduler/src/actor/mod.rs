//! Actors: stateful instances pinned to a dedicated worker
//!
//! ```text
//!   create_actor ──▶ FairQueue ──lease──▶ acquire_dedicated ──StartActor──▶ bind ──▶ Alive
//!                                                                              │
//!   submit_actor_call ──▶ ActorSupervisor::invoke ──(Alive)──▶ CallActor ◀─────┘
//!                                  └──(Starting/Restarting)──▶ buffered
//! ```

mod handle;
mod instance;
mod supervisor;

pub use handle::{ActorHandle, ActorSpec, ActorState, ExitReason};
pub use instance::{Actor, ActorFactory, ActorRegistry};
pub(crate) use supervisor::{
    ActorBinding, ActorSupervisor, Creation, ExitAction, Invocation, PendingCall,
};

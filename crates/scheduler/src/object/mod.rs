//! Object store collaborator
//!
//! The scheduler only needs `put`/`get`/`wait` plus the ability to allocate
//! and seal result slots. [`InMemoryObjectStore`] backs tests and the
//! simulator.

mod memory;
mod store;

pub use memory::InMemoryObjectStore;
pub(crate) use store::ReleaseObject;
pub use store::{ObjectRef, ObjectStore, WaitResult};

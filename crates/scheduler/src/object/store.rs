//! Object store trait definition

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{StoreError, TaskError};
use crate::ids::{ObjectId, TaskId};

/// Told when the last holder of an unpinned object lets go
pub(crate) trait ReleaseObject: Send + Sync {
    fn release(&self, id: ObjectId);
}

/// Shared by every clone of a tracked ref
struct Holder {
    id: ObjectId,
    owner: Weak<dyn ReleaseObject>,
    pinned: AtomicBool,
}

impl Drop for Holder {
    fn drop(&mut self) {
        if self.pinned.load(Ordering::Acquire) {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.release(self.id);
        }
    }
}

/// Handle to a value produced by a task, an actor call or `put`
///
/// Refs handed out by the scheduler are reference counted: once the last
/// clone is dropped the object is freed. Serializing a ref pins its object,
/// because copies outside the process can no longer be counted; a pinned
/// object lives until it is freed explicitly. Refs rebuilt by
/// deserialization never free anything.
#[derive(Clone, Deserialize)]
pub struct ObjectRef {
    id: ObjectId,
    /// Task whose result this is; `None` for `put` objects
    owner: Option<TaskId>,
    #[serde(skip)]
    holder: Option<Arc<Holder>>,
}

impl ObjectRef {
    pub fn new(id: ObjectId, owner: Option<TaskId>) -> Self {
        Self {
            id,
            owner,
            holder: None,
        }
    }

    /// Attach a holder that reports to `owner` when the last clone drops
    pub(crate) fn tracked(mut self, owner: Weak<dyn ReleaseObject>) -> Self {
        self.holder = Some(Arc::new(Holder {
            id: self.id,
            owner,
            pinned: AtomicBool::new(false),
        }));
        self
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Whether dropping every clone would free the object
    pub fn is_counted(&self) -> bool {
        self.holder
            .as_ref()
            .is_some_and(|holder| !holder.pinned.load(Ordering::Acquire))
    }
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(holder) = &self.holder {
            holder.pinned.store(true, Ordering::Release);
        }
        let mut state = serializer.serialize_struct("ObjectRef", 2)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("owner", &self.owner)?;
        state.end()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.owner == other.owner
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.owner.hash(state);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("counted", &self.is_counted())
            .finish()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.id)
    }
}

/// Result of [`ObjectStore::wait`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitResult {
    /// Sealed refs, in input order, at most `num_returns` of them
    pub ready: Vec<ObjectRef>,
    /// Everything else, in input order
    pub remaining: Vec<ObjectRef>,
}

/// Object store consumed by the scheduler
///
/// Results are sealed exactly once, either with a value or with the terminal
/// [`TaskError`] of the producing task. `get` on a failed object returns
/// [`StoreError::Failed`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a value and return a ready ref
    async fn put(&self, value: Value) -> Result<ObjectRef, StoreError>;

    /// Block until the object is sealed, then return its value
    async fn get(&self, object: &ObjectRef) -> Result<Value, StoreError>;

    /// Wait until `num_returns` refs are sealed or `timeout` elapses
    ///
    /// The timeout only bounds this call; producers keep running.
    async fn wait(
        &self,
        refs: &[ObjectRef],
        num_returns: usize,
        timeout: Option<Duration>,
    ) -> WaitResult;

    /// Allocate an unsealed object for a pending result
    fn create_pending(&self, owner: Option<TaskId>) -> ObjectRef;

    /// Seal a pending object
    fn seal(&self, id: ObjectId, result: Result<Value, TaskError>) -> Result<(), StoreError>;

    fn is_ready(&self, id: ObjectId) -> bool;

    /// Bytes currently held by sealed values
    fn memory_usage(&self) -> u64;

    /// Drop an object; later `get`s fail with [`StoreError::NotFound`]
    fn free(&self, id: ObjectId);
}

//! In-memory implementation of ObjectStore

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tracing::trace;

use super::store::{ObjectRef, ObjectStore, WaitResult};
use crate::error::{StoreError, TaskError};
use crate::ids::{ObjectId, TaskId};

type Sealed = Option<Result<Value, TaskError>>;

struct Slot {
    tx: watch::Sender<Sealed>,
    bytes: u64,
}

/// In-memory object store
///
/// Each object is a `watch` channel that flips from `None` to its sealed
/// result, so any number of readers can block on it.
///
/// # Example
///
/// ```
/// use tessera_scheduler::object::{InMemoryObjectStore, ObjectStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryObjectStore::new();
/// let obj = store.put(serde_json::json!({"answer": 42})).await.unwrap();
/// assert_eq!(store.get(&obj).await.unwrap()["answer"], 42);
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, Slot>>,
    bytes: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects, sealed or not
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn receiver(&self, id: ObjectId) -> Option<watch::Receiver<Sealed>> {
        self.objects.read().get(&id).map(|slot| slot.tx.subscribe())
    }

    fn size_of(value: &Value) -> u64 {
        serde_json::to_vec(value).map_or(0, |bytes| bytes.len() as u64)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, value: Value) -> Result<ObjectRef, StoreError> {
        let object = self.create_pending(None);
        self.seal(object.id(), Ok(value))?;
        Ok(object)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Value, StoreError> {
        let mut rx = self
            .receiver(object.id())
            .ok_or(StoreError::NotFound(object.id()))?;

        let sealed = rx
            .wait_for(|sealed| sealed.is_some())
            .await
            .map_err(|_| StoreError::NotFound(object.id()))?;

        match sealed.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(e)) => Err(StoreError::Failed(e.clone())),
            None => Err(StoreError::NotFound(object.id())),
        }
    }

    async fn wait(
        &self,
        refs: &[ObjectRef],
        num_returns: usize,
        timeout: Option<Duration>,
    ) -> WaitResult {
        let target = num_returns.min(refs.len());
        let mut ready = vec![false; refs.len()];
        let mut pending = FuturesUnordered::new();

        for (index, object) in refs.iter().enumerate() {
            match self.receiver(object.id()) {
                Some(rx) if rx.borrow().is_some() => ready[index] = true,
                Some(mut rx) => pending.push(async move {
                    let _ = rx.wait_for(|sealed| sealed.is_some()).await;
                    index
                }),
                // Unknown objects count as ready so `get` reports the error
                None => ready[index] = true,
            }
        }

        let mut count = ready.iter().filter(|r| **r).count();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        while count < target {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => pending.next().await,
            };
            match next {
                Some(index) => {
                    ready[index] = true;
                    count += 1;
                }
                None => break,
            }
        }

        let mut result = WaitResult::default();
        for (object, is_ready) in refs.iter().zip(ready) {
            if is_ready && result.ready.len() < target {
                result.ready.push(object.clone());
            } else {
                result.remaining.push(object.clone());
            }
        }
        result
    }

    fn create_pending(&self, owner: Option<TaskId>) -> ObjectRef {
        let id = ObjectId::new();
        let (tx, _) = watch::channel(None);
        self.objects.write().insert(id, Slot { tx, bytes: 0 });
        ObjectRef::new(id, owner)
    }

    fn seal(&self, id: ObjectId, result: Result<Value, TaskError>) -> Result<(), StoreError> {
        let mut objects = self.objects.write();
        let slot = objects.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if slot.tx.borrow().is_some() {
            return Err(StoreError::AlreadySealed(id));
        }

        let bytes = match &result {
            Ok(value) => Self::size_of(value),
            Err(_) => 0,
        };
        slot.bytes = bytes;
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        slot.tx.send_replace(Some(result));

        trace!(object = %id, bytes, "object sealed");
        Ok(())
    }

    fn is_ready(&self, id: ObjectId) -> bool {
        self.objects
            .read()
            .get(&id)
            .is_some_and(|slot| slot.tx.borrow().is_some())
    }

    fn memory_usage(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn free(&self, id: ObjectId) {
        if let Some(slot) = self.objects.write().remove(&id) {
            self.bytes.fetch_sub(slot.bytes, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryObjectStore::new();
        let obj = store.put(json!("hello")).await.unwrap();

        assert!(store.is_ready(obj.id()));
        assert_eq!(store.get(&obj).await.unwrap(), json!("hello"));
        assert_eq!(store.memory_usage(), 7);
    }

    #[tokio::test]
    async fn test_get_blocks_until_sealed() {
        let store = Arc::new(InMemoryObjectStore::new());
        let obj = store.create_pending(None);

        let reader = {
            let store = Arc::clone(&store);
            let obj = obj.clone();
            tokio::spawn(async move { store.get(&obj).await })
        };

        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        store.seal(obj.id(), Ok(json!(1))).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_failed_object_returns_error() {
        let store = InMemoryObjectStore::new();
        let obj = store.create_pending(None);
        store.seal(obj.id(), Err(TaskError::Cancelled)).unwrap();

        let err = store.get(&obj).await.unwrap_err();
        assert_eq!(err, StoreError::Failed(TaskError::Cancelled));
        assert_eq!(
            store.seal(obj.id(), Ok(json!(null))),
            Err(StoreError::AlreadySealed(obj.id()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_is_advisory() {
        let store = InMemoryObjectStore::new();
        let done = store.put(json!(1)).await.unwrap();
        let pending = store.create_pending(None);

        let result = store
            .wait(
                &[pending.clone(), done.clone()],
                2,
                Some(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(result.ready, vec![done]);
        assert_eq!(result.remaining, vec![pending.clone()]);

        // The pending object can still be sealed and read afterwards
        store.seal(pending.id(), Ok(json!(2))).unwrap();
        assert_eq!(store.get(&pending).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_wait_returns_at_most_num_returns() {
        let store = InMemoryObjectStore::new();
        let a = store.put(json!("a")).await.unwrap();
        let b = store.put(json!("b")).await.unwrap();

        let result = store.wait(&[a.clone(), b.clone()], 1, None).await;
        assert_eq!(result.ready, vec![a]);
        assert_eq!(result.remaining, vec![b]);
    }

    #[tokio::test]
    async fn test_free_releases_bytes() {
        let store = InMemoryObjectStore::new();
        let obj = store.put(json!([1, 2, 3])).await.unwrap();
        assert!(store.memory_usage() > 0);

        store.free(obj.id());
        assert_eq!(store.memory_usage(), 0);
        assert_eq!(
            store.get(&obj).await.unwrap_err(),
            StoreError::NotFound(obj.id())
        );
    }
}

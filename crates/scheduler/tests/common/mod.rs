//! Shared helpers for scheduler integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tessera_scheduler::prelude::*;
use tokio::sync::Semaphore;

/// Default bound on how long any single await in a test may take
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut`, panicking if it takes longer than [`TEST_TIMEOUT`]
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("operation timed out")
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] elapses
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn available_cpu(scheduler: &Scheduler) -> f64 {
    scheduler
        .available_resources()
        .get("CPU")
        .copied()
        .unwrap_or_default()
}

/// Register `hold`: takes one permit from `gate` and returns its argument
///
/// Tasks running `hold` keep their lease until the test opens the gate.
pub fn register_hold(scheduler: &Scheduler) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    let shared = gate.clone();
    scheduler.register_function("hold", move |_ctx, args| {
        let gate = shared.clone();
        async move {
            gate.acquire().await.map_err(TaskFailure::msg)?.forget();
            Ok(args.into_iter().next().unwrap_or(json!(null)))
        }
    });
    gate
}

/// The terminal task error behind a failed `get`
pub fn task_error(result: Result<serde_json::Value, StoreError>) -> TaskError {
    match result {
        Err(StoreError::Failed(err)) => err,
        other => panic!("expected a failed object, got {other:?}"),
    }
}

//! Worker reuse and `max_calls` recycling
//!
//! Run with: cargo test -p tessera-scheduler --test worker_recycling_test

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tessera_scheduler::ids::WorkerId;
use tessera_scheduler::object::ObjectRef;
use tessera_scheduler::prelude::*;
use tessera_scheduler::worker::WorkerState;

use common::{available_cpu, within};

fn scheduler() -> Scheduler {
    let scheduler = Scheduler::new(SchedulerConfig::single_node(2.0)).unwrap();
    scheduler.register_function("whoami", |ctx, _args| async move {
        Ok(json!(ctx.worker_id().as_u64()))
    });
    scheduler.register_function("slow_leaf", |_ctx, args| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    });
    // Returns without waiting for its child, handing the child's ref back
    scheduler.register_function("spawner", |ctx, _args| async move {
        let child = ctx.submit_task(TaskDescriptor::new("slow_leaf").with_arg(json!("from child")))?;
        Ok(json!({
            "worker": ctx.worker_id().as_u64(),
            "child": serde_json::to_value(&child)?,
        }))
    });
    scheduler
}

async fn run_whoami(scheduler: &Scheduler, max_calls: u32) -> u64 {
    let object = scheduler
        .submit_task(TaskDescriptor::new("whoami").with_max_calls(max_calls))
        .unwrap();
    within(scheduler.get(&object))
        .await
        .unwrap()
        .as_u64()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_idle_worker_reused_without_limit() {
    let scheduler = scheduler();

    let first = run_whoami(&scheduler, 0).await;
    let second = run_whoami(&scheduler, 0).await;
    let third = run_whoami(&scheduler, 0).await;
    assert_eq!(first, second);
    assert_eq!(second, third);

    let state = scheduler.worker_pool().worker_state(WorkerId::new(first));
    assert_eq!(state, Some(WorkerState::Idle));
    scheduler.shutdown();
}

#[test_log::test(tokio::test)]
async fn test_worker_exits_after_max_calls() {
    let scheduler = scheduler();

    let first = run_whoami(&scheduler, 2).await;
    let second = run_whoami(&scheduler, 2).await;
    assert_eq!(first, second);

    let worker = WorkerId::new(first);
    within(scheduler.worker_pool().wait_for_exit(worker)).await;
    assert_eq!(
        scheduler.worker_pool().worker_state(worker),
        Some(WorkerState::Exited)
    );

    let third = run_whoami(&scheduler, 2).await;
    assert_ne!(third, first);
    scheduler.shutdown();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_draining_worker_waits_for_children() {
    let scheduler = scheduler();

    let parent = scheduler
        .submit_task(TaskDescriptor::new("spawner").with_max_calls(1))
        .unwrap();
    let reply = within(scheduler.get(&parent)).await.unwrap();
    let worker = WorkerId::new(reply["worker"].as_u64().unwrap());
    let child: ObjectRef = serde_json::from_value(reply["child"].clone()).unwrap();

    // Parent returned, but its child is still running
    assert_eq!(
        scheduler.worker_pool().worker_state(worker),
        Some(WorkerState::Draining)
    );

    // The child's result outlives its parent's worker
    assert_eq!(within(scheduler.get(&child)).await.unwrap(), json!("from child"));
    within(scheduler.worker_pool().wait_for_exit(worker)).await;
    assert_eq!(
        scheduler.worker_pool().worker_state(worker),
        Some(WorkerState::Exited)
    );
    assert_eq!(within(scheduler.get(&child)).await.unwrap(), json!("from child"));

    assert_eq!(available_cpu(&scheduler), 2.0);
    scheduler.ledger().verify().unwrap();
    scheduler.shutdown();
}

#[test_log::test(tokio::test)]
async fn test_crashed_worker_is_replaced() {
    let config = SchedulerConfig::single_node(1.0).with_retry(RetryPolicy::immediate());
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.register_function("crash_once", |ctx, _args| async move {
        if ctx.attempt() == 1 {
            return Err(TaskFailure::Crash("lost process".into()));
        }
        Ok(json!(ctx.worker_id().as_u64()))
    });
    scheduler.register_function("whoami", |ctx, _args| async move {
        Ok(json!(ctx.worker_id().as_u64()))
    });

    let first = run_whoami(&scheduler, 0).await;
    let object = scheduler
        .submit_task(TaskDescriptor::new("crash_once"))
        .unwrap();
    let retried_on = within(scheduler.get(&object)).await.unwrap().as_u64().unwrap();

    // The idle worker took the first attempt and died with it
    assert_eq!(
        scheduler.worker_pool().worker_state(WorkerId::new(first)),
        Some(WorkerState::Exited)
    );
    assert_ne!(retried_on, first);
    assert_eq!(scheduler.worker_pool().snapshot().active, 0);
    scheduler.shutdown();
}

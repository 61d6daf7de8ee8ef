//! Debounced collection broadcast driven through the scheduler
//!
//! Run with: cargo test -p tessera-scheduler --test gc_trigger_test

mod common;

use async_trait::async_trait;
use serde_json::{json, Value};
use tessera_scheduler::gc::{GcConfig, TriggerDecision};
use tessera_scheduler::prelude::*;

use common::within;

const HIGH: u64 = 10_000;
const LOW: u64 = 5_000;

struct Cache {
    entries: usize,
}

#[async_trait]
impl Actor for Cache {
    async fn call(
        &mut self,
        _ctx: &TaskContext,
        _method: &str,
        _args: Vec<Value>,
    ) -> Result<Value, TaskFailure> {
        self.entries += 1;
        Ok(json!(self.entries))
    }

    async fn collect(&mut self) -> bool {
        let reclaimed = self.entries > 0;
        self.entries = 0;
        reclaimed
    }
}

fn scheduler() -> Scheduler {
    let config = SchedulerConfig::single_node(2.0).with_gc(
        GcConfig::default()
            .with_high_watermark(HIGH)
            .with_low_watermark(LOW),
    );
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.register_actor_class("Cache", |_args| Ok(Cache { entries: 0 }));
    scheduler
}

#[test_log::test(tokio::test)]
async fn test_one_broadcast_per_crossing() {
    let scheduler = scheduler();

    assert_eq!(
        scheduler.report_memory_usage(HIGH - 1),
        TriggerDecision::BelowWatermark
    );
    assert_eq!(
        scheduler.report_memory_usage(HIGH),
        TriggerDecision::Triggered { round: 1 }
    );
    // Sustained pressure while the round runs or after it does not re-fire
    let repeat = scheduler.report_memory_usage(HIGH * 2);
    assert!(matches!(
        repeat,
        TriggerDecision::Coalesced | TriggerDecision::AlreadyTriggered
    ));
    within(scheduler.gc().wait_for_rounds(1)).await;
    assert_eq!(
        scheduler.report_memory_usage(HIGH * 2),
        TriggerDecision::AlreadyTriggered
    );

    // Dipping below high but above low does not re-arm
    scheduler.report_memory_usage(LOW + 1);
    assert!(!scheduler.gc().is_armed());
    assert_eq!(
        scheduler.report_memory_usage(HIGH),
        TriggerDecision::AlreadyTriggered
    );

    scheduler.report_memory_usage(LOW);
    assert!(scheduler.gc().is_armed());
    assert_eq!(
        scheduler.report_memory_usage(HIGH),
        TriggerDecision::Triggered { round: 2 }
    );
    within(scheduler.gc().wait_for_rounds(2)).await;
    assert_eq!(scheduler.gc().broadcast_count(), 2);
    assert_eq!(scheduler.gc().history().len(), 2);
    scheduler.shutdown();
}

#[test_log::test(tokio::test)]
async fn test_broadcast_reaches_actor_workers() {
    let scheduler = scheduler();
    let actor = scheduler.create_actor(ActorSpec::new("Cache")).unwrap();
    let object = scheduler.submit_actor_call(&actor, "insert", vec![]).unwrap();
    assert_eq!(within(scheduler.get(&object)).await.unwrap(), json!(1));

    assert_eq!(
        scheduler.report_memory_usage(HIGH),
        TriggerDecision::Triggered { round: 1 }
    );
    within(scheduler.gc().wait_for_rounds(1)).await;

    let history = scheduler.gc().history();
    let round = &history[0];
    assert_eq!(round.round, 1);
    assert_eq!(round.trigger_bytes, HIGH);
    assert!(round.workers >= 1);
    assert_eq!(round.reports, round.workers);
    assert_eq!(round.reclaimed, 1);
    assert!(!round.timed_out);
    scheduler.shutdown();
}

#[test_log::test(tokio::test)]
async fn test_worker_heap_reports_count_toward_watermark() {
    let scheduler = scheduler();
    scheduler.register_function("bloat", |ctx, args| async move {
        ctx.report_heap_usage(args[0].as_u64().unwrap_or(0));
        Ok(Value::Null)
    });

    let object = scheduler
        .submit_task(TaskDescriptor::new("bloat").with_arg(json!(HIGH)))
        .unwrap();
    within(scheduler.get(&object)).await.unwrap();

    within(scheduler.gc().wait_for_rounds(1)).await;
    assert_eq!(scheduler.gc().broadcast_count(), 1);
    assert_eq!(scheduler.worker_pool().total_heap_bytes(), HIGH);
    scheduler.shutdown();
}

#[test_log::test(tokio::test)]
async fn test_dropped_objects_rearm_the_trigger() {
    let scheduler = scheduler();
    let payload = json!("x".repeat(HIGH as usize));

    let first = scheduler.put(payload.clone()).await.unwrap();
    within(scheduler.gc().wait_for_rounds(1)).await;
    assert!(!scheduler.gc().is_armed());

    // Dropping the only ref frees the object and re-arms the trigger
    drop(first);
    assert_eq!(scheduler.object_store_bytes(), 0);
    assert!(scheduler.gc().is_armed());

    let second = scheduler.put(payload).await.unwrap();
    within(scheduler.gc().wait_for_rounds(2)).await;
    assert_eq!(scheduler.gc().broadcast_count(), 2);
    assert_eq!(scheduler.object_store_bytes(), HIGH + 2);
    drop(second);
    scheduler.shutdown();
}

//! Admission benchmarks
//!
//! Measures the hot path of a scheduling tick (queue scan plus ledger
//! reservation) and end-to-end throughput of nested task chains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use tessera_scheduler::ids::NodeId;
use tessera_scheduler::prelude::*;
use tessera_scheduler::queue::{Decision, FairQueue, LaneKey};
use tessera_scheduler::resources::{Quantity, ResourceLedger, ResourceSet, CPU};

fn cpu(amount: f64) -> ResourceSet {
    ResourceSet::new().with(CPU, Quantity::from_f64(amount).unwrap())
}

/// Fill a queue spread over `depths` lanes and drain it through a ledger
fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("fair_queue/tick");

    for (entries, depths) in [(1_000u32, 1u32), (1_000, 8), (10_000, 8)] {
        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("depths_{depths}"), entries),
            &(entries, depths),
            |b, &(entries, depths)| {
                b.iter_custom(|iters| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let ledger = Arc::new(ResourceLedger::new());
                        ledger
                            .add_node(NodeId::from("bench"), cpu(entries as f64))
                            .unwrap();
                        let mut queue = FairQueue::new();
                        for i in 0..entries {
                            queue.push(LaneKey::Depth(i % depths), cpu(0.5), None, i);
                        }

                        let start = Instant::now();
                        let tick = queue.schedule(tokio::time::Instant::now(), |entry| {
                            match ledger.reserve_any(None, &entry.shape) {
                                Some(lease) => Decision::Admit(lease),
                                None => Decision::Retain,
                            }
                        });
                        total += start.elapsed();

                        assert_eq!(tick.admitted.len(), entries as usize);
                    }
                    total
                });
            },
        );
    }
    group.finish();
}

/// Ticks against a saturated ledger: nothing admits, every shape is skipped
fn bench_saturated_tick(c: &mut Criterion) {
    let ledger = Arc::new(ResourceLedger::new());
    ledger.add_node(NodeId::from("bench"), cpu(1.0)).unwrap();
    let _held = ledger.reserve_any(None, &cpu(1.0)).unwrap();

    let mut queue = FairQueue::new();
    for i in 0..10_000u32 {
        let shape = cpu(if i % 2 == 0 { 0.5 } else { 1.0 });
        queue.push(LaneKey::Depth(i % 16), shape, None, i);
    }

    c.bench_function("fair_queue/saturated_10000", |b| {
        b.iter(|| {
            let tick = queue.schedule(tokio::time::Instant::now(), |entry| {
                match ledger.reserve_any(None, &entry.shape) {
                    Some(lease) => Decision::Admit(lease),
                    None => Decision::Retain,
                }
            });
            assert!(tick.admitted.is_empty());
        });
    });
}

/// End-to-end f -> g -> h chains on a small node
fn bench_nested_chains(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("scheduler/chains");
    group.sample_size(10);

    for chains in [10u64, 100] {
        group.throughput(Throughput::Elements(chains));
        group.bench_with_input(BenchmarkId::new("cpus_2", chains), &chains, |b, &chains| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let scheduler = Scheduler::new(SchedulerConfig::single_node(2.0)).unwrap();
                scheduler.register_function("h", |_ctx, args| async move { Ok(args[0].clone()) });
                scheduler.register_function("g", |ctx, args| async move {
                    let child = ctx.submit_task(TaskDescriptor::new("h").with_args(args))?;
                    Ok(ctx.get(&child).await?)
                });
                scheduler.register_function("f", |ctx, args| async move {
                    let child = ctx.submit_task(TaskDescriptor::new("g").with_args(args))?;
                    Ok(ctx.get(&child).await?)
                });

                let start = Instant::now();
                for _ in 0..iters {
                    let refs: Vec<_> = (0..chains)
                        .map(|i| {
                            scheduler
                                .submit_task(TaskDescriptor::new("f").with_arg(json!(i)))
                                .unwrap()
                        })
                        .collect();
                    for object in &refs {
                        scheduler.get(object).await.unwrap();
                    }
                }
                let elapsed = start.elapsed();
                scheduler.shutdown();
                elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tick, bench_saturated_tick, bench_nested_chains);
criterion_main!(benches);

//! Local simulator: runs a recursive f -> g -> h workload against a
//! scheduler configured from `TESSERA_*` environment variables.
//!
//! Extra knobs:
//! - `TESSERA_SIM_CHAINS`: number of top-level chains (default: 200)
//! - `TESSERA_SIM_WORK_MS`: simulated work in each leaf (default: 1)

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tessera_scheduler::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn register_chain(scheduler: &Scheduler, work: Duration) {
    scheduler.register_function("h", move |_ctx, args| async move {
        tokio::time::sleep(work).await;
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(n * 2))
    });
    scheduler.register_function("g", |ctx, args| async move {
        let child = ctx.submit_task(TaskDescriptor::new("h").with_args(args))?;
        let value = ctx.get(&child).await?;
        Ok(json!(value.as_i64().unwrap_or(0) + 1))
    });
    scheduler.register_function("f", |ctx, args| async move {
        let child = ctx.submit_task(TaskDescriptor::new("g").with_args(args))?;
        Ok(ctx.get(&child).await?)
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {:?}", path);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_scheduler=info,tessera_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let chains: usize = env_or("TESSERA_SIM_CHAINS", 200);
    let work = Duration::from_millis(env_or("TESSERA_SIM_WORK_MS", 1));

    let config = SchedulerConfig::from_env().context("Invalid scheduler configuration")?;
    tracing::info!(
        cpus = config.total_cpus(),
        chains,
        work_ms = work.as_millis() as u64,
        "tessera-sim starting"
    );

    let scheduler = Scheduler::new(config).context("Failed to start scheduler")?;
    register_chain(&scheduler, work);

    let started = Instant::now();
    let refs = (0..chains)
        .map(|i| scheduler.submit_task(TaskDescriptor::new("f").with_arg(json!(i))))
        .collect::<Result<Vec<_>, _>>()?;

    let mut failed = 0usize;
    tokio::select! {
        _ = async {
            for (i, object) in refs.iter().enumerate() {
                match scheduler.get(object).await {
                    Ok(value) if value == json!(i as i64 * 2 + 1) => {}
                    Ok(value) => {
                        tracing::warn!(chain = i, %value, "unexpected result");
                        failed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(chain = i, error = %e, "chain failed");
                        failed += 1;
                    }
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let snapshot = scheduler.worker_pool().snapshot();
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        failed,
        rounds = scheduler.scheduling_rounds(),
        workers = ?snapshot,
        "simulation finished"
    );

    scheduler.shutdown();
    scheduler
        .ledger()
        .verify()
        .context("Resource ledger out of balance after shutdown")?;
    Ok(())
}

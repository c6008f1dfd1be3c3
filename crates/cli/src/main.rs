mod cli;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use drainpool_core::config::{load_dotenv, Config};
use drainpool_queue::{BoundedTaskPool, Job};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let mut config = Config::from_env();
    if let Some(capacity) = args.capacity {
        config.pool.capacity = capacity;
    }
    if let Some(ref name) = args.name {
        config.pool.name = name.clone();
    }
    config.validate().context("invalid pool configuration")?;
    config.log_summary();

    let pool = BoundedTaskPool::from_config(&config.pool).context("failed to create pool")?;
    let settled = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    for (index, millis) in args.durations.iter().copied().enumerate() {
        let position = index + 1;
        let job = simulated_job(format!("job-{position}"), millis, args.should_fail(position));
        pool.enqueue(with_report(job, settled.clone()))?;
    }

    let flushing = pool.clone();
    let flush = tokio::spawn(async move { flushing.flush().await });
    if args.late > 0 {
        enqueue_late_jobs(&pool, args.late, args.late_duration, &settled).await;
    }

    flush.await.context("flush task failed")?;

    let stats = pool.stats();
    info!(
        settled = settled.load(Ordering::SeqCst),
        elapsed_ms = elapsed_millis(started.elapsed()),
        "All jobs settled"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        info!("{}", stats);
    }

    Ok(())
}

/// Wait until the pool is draining, then enqueue `count` late jobs.
///
/// Returns how many the pool accepted.
async fn enqueue_late_jobs(
    pool: &BoundedTaskPool,
    count: usize,
    millis: u64,
    settled: &Arc<AtomicUsize>,
) -> usize {
    while !pool.is_draining() {
        tokio::task::yield_now().await;
    }

    let mut accepted = 0;
    for i in 0..count {
        let job = simulated_job(format!("late-{}", i + 1), millis, false);
        match pool.enqueue(with_report(job, settled.clone())) {
            Ok(()) => accepted += 1,
            Err(e) => warn!(error = %e, "Late job rejected"),
        }
    }
    accepted
}

fn elapsed_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// A job that sleeps for `millis` and then succeeds or fails.
fn simulated_job(name: String, millis: u64, fail: bool) -> Job {
    Job::with_args(
        name,
        |(millis, fail): (u64, bool)| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            if fail {
                anyhow::bail!("simulated failure after {}ms", millis);
            }
            Ok(())
        },
        (millis, fail),
    )
}

fn with_report(job: Job, settled: Arc<AtomicUsize>) -> Job {
    let name = job.name().to_string();
    job.on_complete(move |outcome| {
        settled.fetch_add(1, Ordering::SeqCst);
        match outcome.error() {
            None => info!(job = %name, "Job settled"),
            Some(e) => info!(job = %name, error = %e, "Job settled with error"),
        }
    })
}

//! Runnable worker demo.
//!
//! Registers a `matches` handler, submits a burst of swipe jobs with mixed
//! priorities and delays, processes them and prints queue and pool stats.
//!
//! Against Redis:
//!   cargo run --example worker -- --redis-url redis://localhost:6379
//! In process:
//!   cargo run --example worker -- --memory

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use match_jobs::metrics::{export_metrics, init_metrics};
use match_jobs::{
    handler_fn, EngineConfig, HandlerRegistry, JobEngine, JobMeta, JobOptions, MemoryStore,
    WorkerOptions,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const QUEUE: &str = "matches";

/// Submit and process a batch of demo jobs.
#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Run the match-jobs engine against a burst of demo jobs")]
struct Args {
    /// Redis connection URL.
    #[arg(long, env = "JOBQUEUE_REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Use the in-process store instead of Redis.
    #[arg(long)]
    memory: bool,

    /// Number of jobs to submit.
    #[arg(short, long, default_value_t = 20)]
    jobs: u32,

    /// Poll loops for the queue.
    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    /// Seconds to wait for the queue to drain.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,

    /// Print Prometheus metrics before exiting.
    #[arg(long)]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Swipe {
    from: u32,
    to: u32,
}

#[derive(Debug, Serialize)]
struct MatchOutcome {
    pair: String,
    attempt: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    if args.metrics {
        init_metrics()?;
    }

    let handlers = HandlerRegistry::builder()
        .register(
            QUEUE,
            handler_fn(|swipe: Swipe, meta: JobMeta| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                // Every seventh pair fails once to exercise the retry path.
                if (swipe.from + swipe.to) % 7 == 0 && meta.attempt == 1 {
                    anyhow::bail!("match store busy for {}:{}", swipe.from, swipe.to);
                }
                anyhow::Ok(MatchOutcome {
                    pair: format!("{}:{}", swipe.from, swipe.to),
                    attempt: meta.attempt,
                })
            }),
        )?
        .build();

    let config = EngineConfig::from_env()?
        .with_redis_url(args.redis_url.clone())
        .with_backoff_base(Duration::from_millis(100))
        .with_shutdown_timeout(Duration::from_secs(10));

    let engine = if args.memory {
        JobEngine::with_store(Arc::new(MemoryStore::new()), config, handlers)
    } else {
        JobEngine::connect(config, handlers).await?
    };

    let mut ids = Vec::with_capacity(args.jobs as usize);
    for i in 0..args.jobs {
        let options = match i % 5 {
            0 => JobOptions::new().with_priority(10),
            1 => JobOptions::new().with_delay(Duration::from_millis(500)),
            _ => JobOptions::new(),
        };
        let id = engine
            .submit(QUEUE, &Swipe { from: i, to: i * 3 + 1 }, options)
            .await?;
        ids.push(id);
    }
    info!(submitted = ids.len(), "Submitted demo jobs");

    engine.start_processing(
        QUEUE,
        Some(WorkerOptions::new(args.concurrency).with_poll_interval(Duration::from_millis(100))),
    )?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        let stats = engine.get_queue_stats(QUEUE).await?;
        if stats.waiting_jobs() == 0 && engine.pool_stats(QUEUE).is_some_and(|p| p.active_workers == 0) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            info!(waiting = stats.waiting_jobs(), "Gave up waiting for the queue to drain");
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if let Some(pool) = engine.pool_stats(QUEUE) {
        println!(
            "completed={} failed_attempts={} dead_lettered={} avg={:?} success_rate={:.1}%",
            pool.jobs_completed,
            pool.jobs_failed,
            pool.jobs_dead_lettered,
            pool.average_job_duration,
            pool.success_rate()
        );
    }
    engine.stop_all().await?;

    let stats = engine.get_queue_stats(QUEUE).await?;
    println!(
        "queue={} ready={} priority={} delayed={} dead_letter={}",
        stats.queue_name, stats.ready, stats.priority, stats.delayed, stats.dead_letter
    );

    if let Some(id) = ids.first() {
        if let Some(view) = engine.get_job_status(*id).await? {
            println!("first job {} -> {}", id, view.status);
        }
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

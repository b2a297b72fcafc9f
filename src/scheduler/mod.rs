//! Queue topology, producers, workers and admin operations.
//!
//! - **JobQueue**: the four store structures of one named queue and every
//!   atomic move between them
//! - **WorkerPool**: poll loops that sweep, pop, run a handler and route the
//!   outcome
//! - **JobEngine**: one store, one handler registry and a pool per queue
//!
//! # Architecture
//!
//! ```text
//!      submit ──────────────┬──────────────────────┐
//!        │ delay > 0        │ priority > 0         │ otherwise
//!        ▼                  ▼                      ▼
//!   ┌──────────┐  sweep ┌──────────┐          ┌──────────┐
//!   │ delayed  ├───────►│ priority │          │  ready   │
//!   │   set    ├────────┼──────────┼─────────►│  list    │
//!   └────▲─────┘        └────┬─────┘          └────┬─────┘
//!        │                   │ ZPOPMAX first       │ LPOP
//!        │ retry             └─────────┬───────────┘
//!        │ (backoff)                   ▼
//!        │                       ┌───────────┐
//!        └───────────────────────┤  worker   │
//!                                └─────┬─────┘
//!                   attempts exhausted │
//!                                      ▼
//!                                ┌───────────┐  retry_failed_jobs
//!                                │    dlq    ├──────────► ready list
//!                                └───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use match_jobs::scheduler::{handler_fn, HandlerRegistry, JobEngine, JobMeta, JobOptions};
//! use match_jobs::config::EngineConfig;
//!
//! let handlers = HandlerRegistry::builder()
//!     .register("matches", handler_fn(|swipe: Swipe, _meta: JobMeta| async move {
//!         anyhow::Ok(create_match(&swipe).await?)
//!     }))?
//!     .build();
//!
//! let engine = JobEngine::connect(EngineConfig::from_env()?, handlers).await?;
//! engine.submit("matches", &swipe, JobOptions::new().with_priority(5)).await?;
//! engine.start_processing("matches", None)?;
//!
//! // Graceful shutdown
//! engine.stop_all().await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic moves**: every transfer between structures is one transaction
//! - **Idempotent sweeps**: promotions are guarded by removal from the
//!   delayed set, so concurrent sweepers never duplicate a job
//! - **At-most-once pops**: a worker that crashes mid-handler loses the job
//! - **Dead letter queue**: jobs that exhaust their attempts are kept for
//!   inspection and manual requeue

pub mod engine;
pub mod handler;
pub mod job;
pub mod queue;
pub mod status;
pub mod worker_pool;

// Re-export main types for convenience
pub use engine::JobEngine;
pub use handler::{handler_fn, HandlerRegistry, HandlerRegistryBuilder, HandlerResult, JobHandler};
pub use job::{
    Job, JobMeta, JobOptions, JobState, JobStatusView, Placement, RetryPolicy, StatusRecord,
};
pub use queue::{JobQueue, QueueKeys, QueueStats};
pub use status::{StatusTracker, DEFAULT_STATUS_TTL};
pub use worker_pool::{PoolStats, WorkerPool};

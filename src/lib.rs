//! match-jobs: Redis-backed asynchronous job queue engine.
//!
//! This library provides named job queues with priorities, delayed and
//! retried execution, dead-letter handling and per-job status tracking over
//! a shared Redis store, plus worker pools that run registered handlers.

// Core modules
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, WorkerOptions};
pub use error::{PoolError, QueueError, RegistryError, StoreError};
pub use scheduler::{
    handler_fn, HandlerRegistry, Job, JobEngine, JobHandler, JobMeta, JobOptions, JobState,
    JobStatusView, QueueStats,
};
pub use store::{MemoryStore, RedisStore, Store};

//! Metrics module for Prometheus-based monitoring.
//!
//! Worker loops record job outcomes, handler durations, sweep promotions and
//! busy workers; admin stats calls refresh the queue depth gauges.
//!
//! # Example
//!
//! ```ignore
//! use match_jobs::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run the engine ...
//! let body = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{ACTIVE_WORKERS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, REGISTRY, SWEPT_TOTAL};

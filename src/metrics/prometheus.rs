//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics used by the job engine and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all engine metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that left a worker, labeled by queue and outcome
/// (`completed`, `retried`, `dead_lettered`).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler run time in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Structure sizes, labeled by queue and structure
/// (`ready`, `priority`, `delayed`, `dead_letter`).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Workers currently running a handler, labeled by queue.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Delayed jobs promoted by sweeps, labeled by queue.
pub static SWEPT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// first one installed, so initialization is idempotent.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("match_jobs_jobs_total", "Jobs processed by workers"),
        &["queue", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "match_jobs_job_duration_seconds",
            "Handler execution duration in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("match_jobs_queue_depth", "Number of jobs per queue structure"),
        &["queue", "structure"],
    )?;

    let active_workers = GaugeVec::new(
        Opts::new(
            "match_jobs_active_workers",
            "Number of workers currently running a handler",
        ),
        &["queue"],
    )?;

    let swept_total = CounterVec::new(
        Opts::new("match_jobs_swept_total", "Delayed jobs promoted to ready"),
        &["queue"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(swept_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = SWEPT_TOTAL.set(swept_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}

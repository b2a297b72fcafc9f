//! High-level metric recording for the job engine.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labeling. Every method is a no-op until `init_metrics()` has run, so the
//! engine records unconditionally and embedders opt in to export.

use std::time::Duration;

use super::prometheus::{ACTIVE_WORKERS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, SWEPT_TOTAL};
use crate::scheduler::QueueStats;

/// Outcome label for a job leaving a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded.
    Completed,
    /// Handler failed and the job was scheduled again.
    Retried,
    /// Handler failed on the last attempt.
    DeadLettered,
}

impl JobOutcome {
    /// Returns the label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retried => "retried",
            JobOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Metrics collector for recording engine metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job leaving a worker.
    pub fn record_job(&self, queue: &str, outcome: JobOutcome, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    /// Record delayed jobs promoted by a sweep.
    pub fn record_swept(&self, queue: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(swept) = SWEPT_TOTAL.get() {
            swept.with_label_values(&[queue]).inc_by(count as f64);
        }
    }

    /// Update the depth gauges from a stats snapshot.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            let queue = stats.queue_name.as_str();
            for (structure, depth) in [
                ("ready", stats.ready),
                ("priority", stats.priority),
                ("delayed", stats.delayed),
                ("dead_letter", stats.dead_letter),
            ] {
                queue_depth
                    .with_label_values(&[queue, structure])
                    .set(depth as f64);
            }
        }
    }

    /// Increment the active worker gauge.
    pub fn worker_busy(&self, queue: &str) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.with_label_values(&[queue]).inc();
        }
    }

    /// Decrement the active worker gauge.
    pub fn worker_idle(&self, queue: &str) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.with_label_values(&[queue]).dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_outcome_labels() {
        assert_eq!(JobOutcome::Completed.as_str(), "completed");
        assert_eq!(JobOutcome::Retried.as_str(), "retried");
        assert_eq!(JobOutcome::DeadLettered.as_str(), "dead_lettered");
    }

    #[test]
    fn test_recording_shows_up_in_export() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_job("metrics-test", JobOutcome::Completed, Duration::from_millis(12));
        collector.record_swept("metrics-test", 2);
        collector.update_queue_depth(&QueueStats {
            queue_name: "metrics-test".to_string(),
            ready: 3,
            priority: 1,
            delayed: 0,
            dead_letter: 0,
            processing: false,
        });
        collector.worker_busy("metrics-test");
        collector.worker_idle("metrics-test");

        let exported = export_metrics();
        assert!(exported.contains("match_jobs_jobs_total"));
        assert!(exported.contains("metrics-test"));
    }
}

//! Worker pool for processing jobs of one queue.
//!
//! A pool runs `concurrency` independent poll loops against one queue. Each
//! loop sweeps due delayed jobs, pops the next job and runs the queue's
//! handler on it, then routes the outcome: completed, scheduled for retry,
//! or dead-lettered.
//!
//! # Features
//!
//! - Configurable number of poll loops
//! - Graceful shutdown with broadcast channel
//! - Exponential backoff between attempts
//! - Dead letter queue for exhausted jobs
//! - Handler panics are contained to the failed attempt
//! - Outcome writes that hit a store error are retried each poll interval
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::JobHandler;
use super::job::{now_millis, Job, JobState, RetryPolicy};
use super::queue::JobQueue;
use crate::config::WorkerOptions;
use crate::error::{PoolError, QueueError};
use crate::metrics::{JobOutcome, MetricsCollector};

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of poll loops in the pool.
    pub num_workers: usize,
    /// Number of loops currently running a handler.
    pub active_workers: usize,
    /// Handler invocations that succeeded.
    pub jobs_completed: u64,
    /// Handler invocations that failed, whether retried or not.
    pub jobs_failed: u64,
    /// Failures that exhausted the job's attempts.
    pub jobs_dead_lettered: u64,
    /// Average handler duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of handler invocations (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Completed => &self.jobs_completed,
            JobOutcome::Retried => &self.jobs_failed,
            JobOutcome::DeadLettered => {
                self.jobs_dead_lettered.fetch_add(1, Ordering::SeqCst);
                &self.jobs_failed
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let dead_lettered = self.jobs_dead_lettered.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_dead_lettered: dead_lettered,
            average_job_duration: average_duration,
        }
    }
}

/// Poll loops serving one queue with one handler.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    retry_policy: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a stopped pool for `queue`.
    pub fn new(
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
        retry_policy: RetryPolicy,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            queue: Arc::new(queue),
            handler,
            options,
            retry_policy,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Spawns the poll loops. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running and
    /// `PoolError::InvalidOptions` if the options are unusable.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning(self.queue.name().to_string()));
        }
        self.options
            .validate()
            .map_err(|e| PoolError::InvalidOptions(e.to_string()))?;

        self.running.store(true, Ordering::SeqCst);

        for i in 0..self.options.concurrency {
            let worker = Worker {
                id: format!("{}-worker-{}", self.queue.name(), i),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                retry_policy: self.retry_policy,
                shutdown_rx: self.shutdown_tx.subscribe(),
                running: Arc::clone(&self.running),
                poll_interval: self.options.poll_interval,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        info!(
            queue = %self.queue.name(),
            num_workers = self.options.concurrency,
            "Worker pool started"
        );

        Ok(())
    }

    /// Stops the poll loops.
    ///
    /// No new job is popped once this is called. Jobs already handed to a
    /// handler run to completion and their outcome is routed normally. With a
    /// `timeout`, gives up waiting after that long; loops still running then
    /// finish their current job in the background and exit.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was not started and
    /// `PoolError::ShutdownTimeout` if the wait was cut short.
    pub async fn shutdown(&mut self, timeout: Option<Duration>) -> Result<(), PoolError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning(self.queue.name().to_string()));
        }

        info!(queue = %self.queue.name(), "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, shutdown_future).await {
                Ok(()) => {
                    info!(queue = %self.queue.name(), "Worker pool shutdown complete");
                    Ok(())
                }
                Err(_) => {
                    warn!(
                        queue = %self.queue.name(),
                        timeout_ms = limit.as_millis() as u64,
                        "Worker pool shutdown timed out"
                    );
                    Err(PoolError::ShutdownTimeout(limit))
                }
            },
            None => {
                shutdown_future.await;
                info!(queue = %self.queue.name(), "Worker pool shutdown complete");
                Ok(())
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.options.concurrency)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the options the pool was created with.
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Returns the queue served by this pool.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Detached loops exit after their current job.
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A single poll loop.
struct Worker {
    /// Identifier used in logs.
    id: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    retry_policy: RetryPolicy,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    /// Cleared by the pool to stop popping.
    running: Arc<AtomicBool>,
    /// Interval between poll attempts when the queue is empty.
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Sweeps, pops and processes until the pool clears the running flag.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.queue.sweep(now_millis()).await {
                Ok(promoted) => {
                    if promoted > 0 {
                        debug!(worker_id = %self.id, promoted = promoted, "Promoted delayed jobs");
                    }
                    self.metrics.record_swept(self.queue.name(), promoted);
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to sweep delayed jobs");
                    if !self.idle().await {
                        break;
                    }
                    continue;
                }
            }

            // The flag may have been cleared while sweeping.
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match self.queue.pop().await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                }
                Ok(None) => {
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) if e.is_corrupt_job() => {
                    error!(worker_id = %self.id, error = %e, "Dropped undecodable job");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps one poll interval or until shutdown is signalled.
    ///
    /// Returns false when the loop should exit.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => true,
            signal = self.shutdown_rx.recv() => match signal {
                Ok(()) | Err(broadcast::error::RecvError::Closed) => false,
                Err(broadcast::error::RecvError::Lagged(_)) => true,
            },
        }
    }

    /// Runs the handler on one job and routes the outcome.
    async fn process_job(&mut self, mut job: Job) {
        let job_id = job.id;
        let queue = Arc::clone(&self.queue);
        let queue_name = queue.name();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            attempt = job.attempts + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        if let Err(e) = queue.status().transition(&job, JobState::Processing).await {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to record processing status");
        }

        self.stats.increment_active();
        self.metrics.worker_busy(queue_name);
        let start_time = Instant::now();

        let result = self.execute(&job).await;
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.worker_idle(queue_name);

        match result {
            Ok(value) => {
                self.stats.record(JobOutcome::Completed, duration);
                self.metrics
                    .record_job(queue_name, JobOutcome::Completed, duration);

                loop {
                    match queue.status().completed(&job, value.clone(), duration).await {
                        Ok(()) => break,
                        Err(e) => {
                            if !self.wait_to_rewrite(job_id, "record completion", &e).await {
                                break;
                            }
                        }
                    }
                }

                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed successfully"
                );
            }
            Err(message) => {
                job.increment_attempts();
                let outcome = if job.should_retry() {
                    JobOutcome::Retried
                } else {
                    JobOutcome::DeadLettered
                };
                self.stats.record(outcome, duration);
                self.metrics.record_job(queue_name, outcome, duration);

                let policy = self.retry_policy;
                loop {
                    let written = match outcome {
                        JobOutcome::Retried => queue
                            .schedule_retry(job.clone(), &message, &policy)
                            .await
                            .map(drop),
                        _ => queue.dead_letter(job.clone(), &message).await.map(drop),
                    };
                    match written {
                        Ok(()) => break,
                        Err(e) => {
                            let action = match outcome {
                                JobOutcome::Retried => "schedule retry",
                                _ => "dead-letter job",
                            };
                            if !self.wait_to_rewrite(job_id, action, &e).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Waits one poll interval after a failed outcome write.
    ///
    /// The popped job lives only in this loop until the write lands, so the
    /// write is retried until it succeeds. Returns false once shutdown has
    /// been signalled, after logging the job as lost.
    async fn wait_to_rewrite(&mut self, job_id: Uuid, action: &str, error: &QueueError) -> bool {
        if self.running.load(Ordering::SeqCst) && self.idle().await {
            warn!(
                worker_id = %self.id,
                job_id = %job_id,
                error = %error,
                "Failed to {}, retrying",
                action
            );
            return true;
        }

        error!(
            worker_id = %self.id,
            job_id = %job_id,
            error = %error,
            "Failed to {} before shutdown, job lost",
            action
        );
        false
    }

    /// Invokes the handler on its own task so a panic fails only this
    /// attempt. Returns the handler's result or the failure message.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, String> {
        let handler = Arc::clone(&self.handler);
        let payload = job.payload.clone();
        let meta = job.meta();

        match tokio::spawn(async move { handler.handle(payload, meta).await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) if e.is_panic() => Err("handler panicked".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

//! Engine facade tying queues, handlers and worker pools together.
//!
//! A [`JobEngine`] owns one store connection, a frozen [`HandlerRegistry`]
//! and at most one [`WorkerPool`] per queue. Producers and admin callers can
//! share the engine freely; any number of engine instances in any number of
//! processes may serve the same queues through the same store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::handler::HandlerRegistry;
use super::job::{Job, JobOptions, JobStatusView, StatusRecord};
use super::queue::{JobQueue, QueueStats};
use super::status::StatusTracker;
use super::worker_pool::{PoolStats, WorkerPool};
use crate::config::{EngineConfig, WorkerOptions};
use crate::error::{PoolError, QueueError, StoreError};
use crate::metrics::MetricsCollector;
use crate::store::{RedisStore, Store};

/// Job engine over a shared store.
pub struct JobEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
    handlers: HandlerRegistry,
    status: StatusTracker,
    pools: Mutex<HashMap<String, WorkerPool>>,
    metrics: MetricsCollector,
}

impl JobEngine {
    /// Connects to Redis at `config.redis_url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the connection or the initial ping fails.
    pub async fn connect(
        config: EngineConfig,
        handlers: HandlerRegistry,
    ) -> Result<Self, StoreError> {
        let store = RedisStore::connect(&config.redis_url).await?;
        Ok(Self::with_store(Arc::new(store), config, handlers))
    }

    /// Creates an engine over an existing store.
    pub fn with_store(
        store: Arc<dyn Store>,
        config: EngineConfig,
        handlers: HandlerRegistry,
    ) -> Self {
        let status = StatusTracker::new(Arc::clone(&store), config.status_ttl);
        info!(
            handlers = handlers.len(),
            status_ttl_secs = config.status_ttl.as_secs(),
            "Job engine created"
        );

        Self {
            store,
            config,
            handlers,
            status,
            pools: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Returns a handle to the queue named `name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidQueueName` for unusable names.
    pub fn queue(&self, name: &str) -> Result<JobQueue, QueueError> {
        JobQueue::new(Arc::clone(&self.store), self.status.clone(), name)
    }

    /// Submits one job and returns its id.
    pub async fn submit<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<Uuid, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let job = self.queue(queue)?.submit(payload, options).await?;
        Ok(job.id)
    }

    /// Submits several jobs with default options and returns their ids in
    /// input order.
    pub async fn submit_batch<T: Serialize>(
        &self,
        queue: &str,
        payloads: &[T],
    ) -> Result<Vec<Uuid>, QueueError> {
        let payloads = payloads
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let jobs = self.queue(queue)?.submit_batch(payloads).await?;
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Returns the status summary of a job, or `None` if it is unknown or its
    /// record expired.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatusView>, QueueError> {
        self.status.status(job_id).await
    }

    /// Returns the full status record of a job.
    pub async fn get_status_record(
        &self,
        job_id: Uuid,
    ) -> Result<Option<StatusRecord>, QueueError> {
        self.status.record(job_id).await
    }

    /// Returns structure sizes for `queue` and whether this engine is
    /// processing it.
    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut stats = self.queue(queue)?.stats().await?;
        stats.processing = self.is_processing(queue);
        self.metrics.update_queue_depth(&stats);
        Ok(stats)
    }

    /// Deletes the waiting structures of `queue`, and its dead-letter list if
    /// `include_dead_letter` is set.
    pub async fn clear_queue(&self, queue: &str, include_dead_letter: bool) -> Result<(), QueueError> {
        self.queue(queue)?.clear(include_dead_letter).await?;
        warn!(
            queue = queue,
            include_dead_letter = include_dead_letter,
            "Queue cleared"
        );
        Ok(())
    }

    /// Moves up to `limit` dead-letter entries back to the ready list with
    /// their attempts reset. Returns the number moved.
    pub async fn retry_failed_jobs(&self, queue: &str, limit: usize) -> Result<usize, QueueError> {
        let moved = self.queue(queue)?.retry_failed(limit).await?;
        info!(queue = queue, moved = moved, "Retried failed jobs");
        Ok(moved)
    }

    /// Returns up to `limit` dead-letter entries without removing them.
    pub async fn peek_dead_letter(&self, queue: &str, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.queue(queue)?.peek_dead_letter(limit).await
    }

    /// Starts processing `queue` with its registered handler.
    ///
    /// Uses the configured default worker options when `options` is `None`.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoHandler` if no handler is registered for the
    /// queue, `PoolError::AlreadyRunning` if it is already being processed
    /// and `PoolError::InvalidOptions` for unusable options.
    pub fn start_processing(
        &self,
        queue: &str,
        options: Option<WorkerOptions>,
    ) -> Result<(), PoolError> {
        let handler = self
            .handlers
            .get(queue)
            .ok_or_else(|| PoolError::NoHandler(queue.to_string()))?;
        let options = options.unwrap_or(self.config.worker_options);
        let job_queue = self.queue(queue)?;

        let mut pools = self.pools.lock().expect("worker pools lock poisoned");
        if pools.contains_key(queue) {
            return Err(PoolError::AlreadyRunning(queue.to_string()));
        }

        let mut pool = WorkerPool::new(job_queue, handler, options, self.config.retry_policy);
        pool.start()?;
        pools.insert(queue.to_string(), pool);
        Ok(())
    }

    /// Starts every queue that has a handler, with default options.
    /// Queues already being processed are left alone.
    pub fn start_all(&self) -> Result<(), PoolError> {
        for queue in self.handlers.queues() {
            match self.start_processing(&queue, None) {
                Ok(()) | Err(PoolError::AlreadyRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stops processing `queue`, waiting for in-flight handlers to finish.
    ///
    /// Returns false if the queue was not being processed.
    pub async fn stop_processing(&self, queue: &str) -> Result<bool, PoolError> {
        let pool = self
            .pools
            .lock()
            .expect("worker pools lock poisoned")
            .remove(queue);

        match pool {
            Some(mut pool) => {
                pool.shutdown(self.config.shutdown_timeout).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops every queue this engine is processing.
    ///
    /// All pools are signalled before any is awaited. Returns the first
    /// shutdown error after every pool has been stopped.
    pub async fn stop_all(&self) -> Result<(), PoolError> {
        let pools: Vec<(String, WorkerPool)> = self
            .pools
            .lock()
            .expect("worker pools lock poisoned")
            .drain()
            .collect();

        if pools.is_empty() {
            return Ok(());
        }

        let timeout = self.config.shutdown_timeout;
        let results = futures::future::join_all(pools.into_iter().map(
            |(queue, mut pool)| async move {
                let result = pool.shutdown(timeout).await;
                if let Err(e) = &result {
                    warn!(queue = %queue, error = %e, "Worker pool did not stop cleanly");
                }
                result
            },
        ))
        .await;

        info!("All worker pools stopped");
        results.into_iter().collect()
    }

    /// Returns whether this engine is processing `queue`.
    pub fn is_processing(&self, queue: &str) -> bool {
        self.pools
            .lock()
            .expect("worker pools lock poisoned")
            .get(queue)
            .is_some_and(|pool| pool.is_running())
    }

    /// Returns the queues this engine is processing, sorted.
    pub fn active_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .pools
            .lock()
            .expect("worker pools lock poisoned")
            .keys()
            .cloned()
            .collect();
        queues.sort();
        queues
    }

    /// Returns worker statistics for `queue` if it is being processed.
    pub fn pool_stats(&self, queue: &str) -> Option<PoolStats> {
        self.pools
            .lock()
            .expect("worker pools lock poisoned")
            .get(queue)
            .map(WorkerPool::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::handler::handler_fn;
    use crate::scheduler::job::{JobMeta, JobState};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn engine(handlers: HandlerRegistry) -> JobEngine {
        let config = EngineConfig::new().with_worker_options(
            WorkerOptions::new(1).with_poll_interval(Duration::from_millis(10)),
        );
        JobEngine::with_store(Arc::new(MemoryStore::new()), config, handlers)
    }

    fn echo_registry(queue: &str) -> HandlerRegistry {
        HandlerRegistry::builder()
            .register(
                queue,
                handler_fn(|payload: serde_json::Value, _: JobMeta| async move {
                    anyhow::Ok(payload)
                }),
            )
            .expect("register")
            .build()
    }

    #[tokio::test]
    async fn test_submit_and_status() {
        let engine = engine(HandlerRegistry::default());
        let id = engine
            .submit("matches", &json!({"a": 1}), JobOptions::new())
            .await
            .unwrap();

        let view = engine.get_job_status(id).await.unwrap().expect("status");
        assert_eq!(view.status, JobState::Pending);
        assert!(engine.get_job_status(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_batch_preserves_order() {
        let engine = engine(HandlerRegistry::default());
        let ids = engine
            .submit_batch("matches", &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let queue = engine.queue("matches").unwrap();
        for id in ids {
            assert_eq!(queue.pop().await.unwrap().unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn test_start_processing_requires_handler() {
        let engine = engine(HandlerRegistry::default());
        assert!(matches!(
            engine.start_processing("orphan", None),
            Err(PoolError::NoHandler(_))
        ));
        assert!(!engine.is_processing("orphan"));
    }

    #[tokio::test]
    async fn test_processing_lifecycle() {
        let engine = engine(echo_registry("matches"));

        engine.start_processing("matches", None).unwrap();
        assert!(matches!(
            engine.start_processing("matches", None),
            Err(PoolError::AlreadyRunning(_))
        ));
        assert!(engine.is_processing("matches"));
        assert_eq!(engine.active_queues(), vec!["matches"]);
        assert!(engine.get_queue_stats("matches").await.unwrap().processing);

        assert!(engine.stop_processing("matches").await.unwrap());
        assert!(!engine.stop_processing("matches").await.unwrap());
        assert!(!engine.is_processing("matches"));
        assert!(engine.pool_stats("matches").is_none());
        assert!(!engine.get_queue_stats("matches").await.unwrap().processing);
    }

    #[tokio::test]
    async fn test_start_all_and_stop_all() {
        let registry = HandlerRegistry::builder()
            .register(
                "a",
                handler_fn(|_: serde_json::Value, _: JobMeta| async move { anyhow::Ok(()) }),
            )
            .and_then(|b| {
                b.register(
                    "b",
                    handler_fn(|_: serde_json::Value, _: JobMeta| async move { anyhow::Ok(()) }),
                )
            })
            .expect("register")
            .build();
        let engine = engine(registry);

        engine.start_all().unwrap();
        assert_eq!(engine.active_queues(), vec!["a", "b"]);

        engine.stop_all().await.unwrap();
        assert!(engine.active_queues().is_empty());
        engine.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let engine = engine(HandlerRegistry::default());
        let queue = engine.queue("q").unwrap();
        for i in 0..3 {
            queue
                .dead_letter(Job::new("q", json!(i), &JobOptions::default()), "boom")
                .await
                .unwrap();
        }
        engine.submit("q", &json!("x"), JobOptions::new()).await.unwrap();

        assert_eq!(engine.peek_dead_letter("q", 10).await.unwrap().len(), 3);
        assert_eq!(engine.retry_failed_jobs("q", 2).await.unwrap(), 2);

        let stats = engine.get_queue_stats("q").await.unwrap();
        assert_eq!(stats.ready, 3);
        assert_eq!(stats.dead_letter, 1);

        engine.clear_queue("q", false).await.unwrap();
        let stats = engine.get_queue_stats("q").await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.dead_letter, 1);

        engine.clear_queue("q", true).await.unwrap();
        assert_eq!(engine.get_queue_stats("q").await.unwrap().total_jobs(), 0);
    }

    #[tokio::test]
    async fn test_invalid_queue_name_is_rejected() {
        let engine = engine(HandlerRegistry::default());
        let err = engine
            .submit("has space", &json!(1), JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)));
    }
}

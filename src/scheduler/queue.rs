//! Store-backed queue topology.
//!
//! Each named queue is made of four structures in the shared store:
//!
//! - `queue:{name}`: ready list, FIFO (append at tail, pop from head)
//! - `queue:{name}:priority`: priority set, scored by priority, highest first
//! - `queue:{name}:delayed`: delayed set, scored by execute-at time
//! - `queue:{name}:dlq`: dead-letter list, oldest entry at the head
//!
//! A job is a member of exactly one structure at a time, or of none while a
//! worker is executing it. Every move between structures is a single atomic
//! [`Batch`]; moves out of the delayed set and the dead-letter list are
//! guarded by the removal, so concurrent sweepers never duplicate a job.
//!
//! # Delivery
//!
//! Dequeueing removes the job in the same step that returns it. There is no
//! in-flight ledger: a worker that crashes mid-handler loses the job. Pops are
//! logged with the job id so such losses can be traced.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use super::job::{now_millis, Job, JobOptions, JobState, Placement, RetryPolicy, StatusRecord};
use super::status::StatusTracker;
use crate::error::{validate_queue_name, QueueError};
use crate::store::{Batch, Guard, Store};

/// Store keys of one queue's structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Ready list.
    pub ready: String,
    /// Priority set.
    pub priority: String,
    /// Delayed set.
    pub delayed: String,
    /// Dead-letter list.
    pub dead_letter: String,
}

impl QueueKeys {
    /// Builds the key layout for `queue`.
    pub fn new(queue: &str) -> Self {
        Self {
            ready: format!("queue:{}", queue),
            priority: format!("queue:{}:priority", queue),
            delayed: format!("queue:{}:delayed", queue),
            dead_letter: format!("queue:{}:dlq", queue),
        }
    }
}

/// Structure sizes of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Jobs in the ready list.
    pub ready: usize,
    /// Jobs in the priority set.
    pub priority: usize,
    /// Jobs in the delayed set, including scheduled retries.
    pub delayed: usize,
    /// Jobs in the dead-letter list.
    pub dead_letter: usize,
    /// Whether this process has pollers running for the queue.
    pub processing: bool,
}

impl QueueStats {
    /// Returns the number of jobs held in all structures.
    pub fn total_jobs(&self) -> usize {
        self.ready + self.priority + self.delayed + self.dead_letter
    }

    /// Returns the number of jobs that will eventually be served.
    pub fn waiting_jobs(&self) -> usize {
        self.ready + self.priority + self.delayed
    }
}

/// One named queue over a shared store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
    status: StatusTracker,
    name: String,
    keys: QueueKeys,
}

impl JobQueue {
    /// Creates a handle to the queue named `name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidQueueName` for empty names or names with
    /// whitespace.
    pub fn new(
        store: Arc<dyn Store>,
        status: StatusTracker,
        name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        if !validate_queue_name(&name) {
            return Err(QueueError::InvalidQueueName(name));
        }
        let keys = QueueKeys::new(&name);
        Ok(Self {
            store,
            status,
            name,
            keys,
        })
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the store keys of this queue.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Returns the status tracker used by this queue.
    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Adds the insert for `job` at `placement` to `batch`.
    fn place(&self, batch: Batch, placement: Placement, encoded: String) -> Batch {
        match placement {
            Placement::Delayed { execute_at } => {
                batch.zadd(&self.keys.delayed, encoded, execute_at as f64)
            }
            Placement::Priority { priority } => {
                batch.zadd(&self.keys.priority, encoded, priority as f64)
            }
            Placement::Ready => batch.push_back(&self.keys.ready, encoded),
        }
    }

    /// Submits one job.
    ///
    /// The job lands in the delayed set if it has a delay, else in the
    /// priority set if its priority is positive, else at the tail of the
    /// ready list. Its `pending` status record is written in the same atomic
    /// batch.
    pub async fn submit(
        &self,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        options.validate().map_err(QueueError::InvalidOptions)?;

        let job = Job::new(&self.name, payload, &options);
        let placement = Placement::for_submission(&job);
        let status = self
            .status
            .write_op(&StatusRecord::new(&job, JobState::Pending))?;

        let batch = self.place(Batch::new(), placement, job.encode()?).op(status);
        self.store.exec(batch).await?;

        debug!(
            queue = %self.name,
            job_id = %job.id,
            placement = ?placement,
            "Job submitted"
        );
        Ok(job)
    }

    /// Submits several jobs with default options in one atomic batch.
    ///
    /// Jobs are appended to the ready list in input order; workers see either
    /// all of them or none.
    pub async fn submit_batch(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<Job>, QueueError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let options = JobOptions::default();
        let jobs: Vec<Job> = payloads
            .into_iter()
            .map(|payload| Job::new(&self.name, payload, &options))
            .collect();

        let mut batch = Batch::new();
        for job in &jobs {
            batch = batch.push_back(&self.keys.ready, job.encode()?);
        }
        for job in &jobs {
            batch = batch.op(
                self.status
                    .write_op(&StatusRecord::new(job, JobState::Pending))?,
            );
        }
        self.store.exec(batch).await?;

        debug!(queue = %self.name, count = jobs.len(), "Job batch submitted");
        Ok(jobs)
    }

    /// Promotes every delayed job whose time has come.
    ///
    /// Each promotion is guarded by removal from the delayed set, so running
    /// the sweep concurrently from several workers or processes moves each job
    /// exactly once. Returns the number of jobs this call promoted.
    pub async fn sweep(&self, now_ms: i64) -> Result<usize, QueueError> {
        let due = self
            .store
            .zrange_by_score(&self.keys.delayed, f64::NEG_INFINITY, now_ms as f64, None)
            .await?;

        let mut promoted = 0;
        for raw in due {
            let guard = Guard::ZRem {
                key: self.keys.delayed.clone(),
                member: raw.clone(),
            };

            let job = match Job::decode(&raw) {
                Ok(job) => job,
                Err(e) => {
                    error!(
                        queue = %self.name,
                        error = %e,
                        "Dropping undecodable member of delayed set"
                    );
                    self.store.exec(Batch::guarded(guard)).await?;
                    continue;
                }
            };

            let placement = Placement::for_promotion(&job);
            let status = self
                .status
                .write_op(&StatusRecord::new(&job, JobState::Pending))?;
            let batch = self
                .place(Batch::guarded(guard), placement, raw)
                .op(status);

            if self.store.exec(batch).await? {
                promoted += 1;
                debug!(queue = %self.name, job_id = %job.id, "Promoted delayed job");
            }
        }

        Ok(promoted)
    }

    /// Pops the next job: highest priority first, then the oldest ready job.
    ///
    /// # Errors
    ///
    /// A member that cannot be decoded has already been removed from the
    /// store when `QueueError::Serialization` is returned.
    pub async fn pop(&self) -> Result<Option<Job>, QueueError> {
        let raw = match self.store.zpop_max(&self.keys.priority).await? {
            Some((raw, _)) => raw,
            None => match self.store.pop_front(&self.keys.ready).await? {
                Some(raw) => raw,
                None => return Ok(None),
            },
        };

        let job = Job::decode(&raw)?;
        debug!(queue = %self.name, job_id = %job.id, "Popped job");
        Ok(Some(job))
    }

    /// Puts a failed job back into the delayed set for another attempt.
    ///
    /// `job.attempts` must already count the failure.
    pub async fn schedule_retry(
        &self,
        mut job: Job,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Job, QueueError> {
        let backoff = policy.backoff(job.attempts);
        let backoff_ms = i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX);
        let retry_at = now_millis().saturating_add(backoff_ms);
        job.retry_at = Some(retry_at);

        let status = self
            .status
            .write_op(&StatusRecord::new(&job, JobState::Retry).with_error(error))?;
        let batch = Batch::new()
            .zadd(&self.keys.delayed, job.encode()?, retry_at as f64)
            .op(status);
        self.store.exec(batch).await?;

        warn!(
            queue = %self.name,
            job_id = %job.id,
            attempts = job.attempts,
            backoff_ms = backoff_ms,
            error = %error,
            "Job failed, scheduled for retry"
        );
        Ok(job)
    }

    /// Appends a job that exhausted its attempts to the dead-letter list.
    pub async fn dead_letter(&self, mut job: Job, error: &str) -> Result<Job, QueueError> {
        job.error = Some(error.to_string());
        job.failed_at = Some(now_millis());

        let status = self
            .status
            .write_op(&StatusRecord::new(&job, JobState::Failed).with_error(error))?;
        let batch = Batch::new()
            .push_back(&self.keys.dead_letter, job.encode()?)
            .op(status);
        self.store.exec(batch).await?;

        error!(
            queue = %self.name,
            job_id = %job.id,
            attempts = job.attempts,
            error = %error,
            "Job failed, moved to dead letter queue"
        );
        Ok(job)
    }

    /// Moves up to `limit` dead-letter entries, oldest first, back to the
    /// ready list with their attempts reset.
    ///
    /// Each entry moves atomically; the batch as a whole does not. An entry
    /// another caller moved first is skipped. Returns the number moved.
    pub async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError> {
        if limit == 0 {
            return Ok(0);
        }

        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let entries = self
            .store
            .list_range(&self.keys.dead_letter, 0, stop)
            .await?;

        let mut moved = 0;
        for raw in entries {
            let mut job = match Job::decode(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        error = %e,
                        "Skipping undecodable dead letter entry"
                    );
                    continue;
                }
            };

            job.attempts = 0;
            job.retried_at = Some(now_millis());
            job.retry_at = None;
            job.error = None;
            job.failed_at = None;

            let status = self
                .status
                .write_op(&StatusRecord::new(&job, JobState::Pending))?;
            let batch = Batch::guarded(Guard::LRem {
                key: self.keys.dead_letter.clone(),
                value: raw,
            })
            .push_back(&self.keys.ready, job.encode()?)
            .op(status);

            if self.store.exec(batch).await? {
                moved += 1;
            }
        }

        if moved > 0 {
            debug!(queue = %self.name, moved = moved, "Requeued dead letter jobs");
        }
        Ok(moved)
    }

    /// Returns up to `limit` dead-letter entries, oldest first, without
    /// removing them.
    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let entries = self
            .store
            .list_range(&self.keys.dead_letter, 0, stop)
            .await?;

        let jobs = entries
            .iter()
            .filter_map(|raw| match Job::decode(raw) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        error = %e,
                        "Skipping undecodable dead letter entry"
                    );
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Deletes the ready, priority and delayed structures, and the
    /// dead-letter list if asked. Jobs already popped are unaffected.
    pub async fn clear(&self, include_dead_letter: bool) -> Result<(), QueueError> {
        let mut keys = vec![
            self.keys.ready.clone(),
            self.keys.priority.clone(),
            self.keys.delayed.clone(),
        ];
        if include_dead_letter {
            keys.push(self.keys.dead_letter.clone());
        }
        self.store.del(&keys).await?;
        Ok(())
    }

    /// Returns structure sizes. `processing` is left false; the engine fills
    /// it in from its own pool state.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (ready, priority, delayed, dead_letter) = tokio::try_join!(
            self.store.list_len(&self.keys.ready),
            self.store.zcard(&self.keys.priority),
            self.store.zcard(&self.keys.delayed),
            self.store.list_len(&self.keys.dead_letter),
        )?;

        Ok(QueueStats {
            queue_name: self.name.clone(),
            ready,
            priority,
            delayed,
            dead_letter,
            processing: false,
        })
    }

    /// Returns whether a job id is currently waiting in the delayed set.
    ///
    /// This scans the set and is meant for diagnostics and tests.
    pub async fn is_delayed(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let members = self
            .store
            .zrange_by_score(&self.keys.delayed, f64::NEG_INFINITY, f64::INFINITY, None)
            .await?;
        Ok(members
            .iter()
            .filter_map(|raw| Job::decode(raw).ok())
            .any(|job| job.id == job_id))
    }
}

//! Per-job status tracking.
//!
//! Status records are observability data: they expire after a TTL and are
//! never consulted for scheduling. The source of truth for where a job is
//! remains its membership in a queue structure.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::job::{Job, JobState, JobStatusView, StatusRecord};
use crate::error::QueueError;
use crate::store::{Op, Store};

/// Default lifetime of a status record.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Returns the key of a job's status record.
pub fn status_key(job_id: Uuid) -> String {
    format!("job:{}:status", job_id)
}

/// Writes and reads status records.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl StatusTracker {
    /// Creates a tracker whose records expire after `ttl`.
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Returns the record lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Builds the write for `record` so callers can fold it into a batch.
    pub fn write_op(&self, record: &StatusRecord) -> Result<Op, QueueError> {
        Ok(Op::SetEx {
            key: status_key(record.job.id),
            value: serde_json::to_string(record)?,
            ttl_secs: self.ttl.as_secs().max(1),
        })
    }

    /// Persists a record on its own.
    pub async fn write(&self, record: &StatusRecord) -> Result<(), QueueError> {
        let value = serde_json::to_string(record)?;
        self.store
            .set_ex(&status_key(record.job.id), &value, self.ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// Records a bare transition of `job` into `state`.
    pub async fn transition(&self, job: &Job, state: JobState) -> Result<(), QueueError> {
        self.write(&StatusRecord::new(job, state)).await
    }

    /// Records a successful completion.
    pub async fn completed(
        &self,
        job: &Job,
        result: serde_json::Value,
        duration: Duration,
    ) -> Result<(), QueueError> {
        self.write(&StatusRecord::new(job, JobState::Completed).with_result(result, duration))
            .await
    }

    /// Reads the full record for a job.
    pub async fn record(&self, job_id: Uuid) -> Result<Option<StatusRecord>, QueueError> {
        match self.store.get(&status_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reads the caller-facing summary for a job.
    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobStatusView>, QueueError> {
        Ok(self.record(job_id).await?.map(JobStatusView::from))
    }
}

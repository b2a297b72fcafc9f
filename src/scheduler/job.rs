//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the engine:
//!
//! - `Job`: A unit of work and its scheduling metadata
//! - `JobOptions`: Submission options (priority, delay, attempt ceiling)
//! - `JobMeta`: The read-only view of a job handed to handlers
//! - `JobState`: Lifecycle states recorded by the status tracker
//! - `StatusRecord`: A persisted snapshot of a job at a state transition
//! - `RetryPolicy`: Exponential backoff between attempts
//!
//! Jobs are stored as JSON with camelCase field names and epoch-millisecond
//! timestamps so producers written in other languages can share queues.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for jobs (0 means no priority tier).
pub const DEFAULT_PRIORITY: i64 = 0;

/// Largest priority magnitude the priority set scores exactly (2^53).
pub const MAX_PRIORITY: i64 = 1 << 53;

/// Default backoff base between attempts.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Options accepted at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Priority tier; 0 means none, higher values are served first.
    pub priority: i64,
    /// Milliseconds before the job becomes ready.
    pub delay_ms: u64,
    /// Ceiling on execution attempts.
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay_ms: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl JobOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority. Values outside `-MAX_PRIORITY..=MAX_PRIORITY` are
    /// rejected at submission.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the delay before the job becomes ready.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the delay in milliseconds.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Checks the options, returning a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.priority.unsigned_abs() > MAX_PRIORITY.unsigned_abs() {
            return Err(format!(
                "priority {} is outside +/-{}",
                self.priority, MAX_PRIORITY
            ));
        }
        if i64::try_from(self.delay_ms).is_err() {
            return Err(format!("delay_ms {} is out of range", self.delay_ms));
        }
        Ok(())
    }
}

/// A job representing a unit of work to be executed.
///
/// The payload is opaque to the engine. Only the handler registered for
/// `queue` ever decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier, assigned at submission.
    pub id: Uuid,
    /// Name of the logical queue.
    pub queue: String,
    /// Caller-defined data.
    pub payload: serde_json::Value,
    /// Number of failed execution attempts so far.
    pub attempts: u32,
    /// Maximum number of attempts before dead-lettering.
    pub max_attempts: u32,
    /// Priority tier (0 = none).
    pub priority: i64,
    /// Delay requested at submission.
    #[serde(default)]
    pub delay_ms: u64,
    /// Submission time.
    pub created_at: i64,
    /// When a delayed job becomes ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<i64>,
    /// When a failed job is scheduled to run again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<i64>,
    /// When an operator moved the job out of the dead-letter list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<i64>,
    /// Last handler error, kept on dead-lettered jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job exhausted its attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

impl Job {
    /// Creates a new job for `queue`, stamped with the current time.
    pub fn new(queue: impl Into<String>, payload: serde_json::Value, options: &JobOptions) -> Self {
        let created_at = now_millis();
        let execute_at = (options.delay_ms > 0)
            .then(|| created_at.saturating_add(i64::try_from(options.delay_ms).unwrap_or(i64::MAX)));

        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts,
            priority: options.priority,
            delay_ms: options.delay_ms,
            created_at,
            execute_at,
            retry_at: None,
            retried_at: None,
            error: None,
            failed_at: None,
        }
    }

    /// Records a failed attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Returns whether the job may run again after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns the view handed to the handler for the next invocation.
    pub fn meta(&self) -> JobMeta {
        JobMeta {
            id: self.id,
            queue: self.queue.clone(),
            attempt: self.attempts + 1,
            max_attempts: self.max_attempts,
            priority: self.priority,
            created_at: self.created_at,
        }
    }

    /// Encodes the job as stored in queue structures.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a job read from a queue structure.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Where a job is placed when it enters the queue topology.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// Delayed set, scored by execute-at time.
    Delayed { execute_at: i64 },
    /// Priority set, scored by priority.
    Priority { priority: i64 },
    /// Tail of the ready list.
    Ready,
}

impl Placement {
    /// Placement at submission: delay first, then priority, then ready.
    ///
    /// A job that is both delayed and prioritized only competes on priority
    /// once its delay has elapsed.
    pub fn for_submission(job: &Job) -> Self {
        match job.execute_at {
            Some(execute_at) if job.delay_ms > 0 => Placement::Delayed { execute_at },
            _ => Self::for_promotion(job),
        }
    }

    /// Placement when a job leaves the delayed set.
    pub fn for_promotion(job: &Job) -> Self {
        if job.priority > 0 {
            Placement::Priority {
                priority: job.priority,
            }
        } else {
            Placement::Ready
        }
    }
}

/// Read-only job metadata passed to handlers alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    /// Job identifier.
    pub id: Uuid,
    /// Queue the job was dequeued from.
    pub queue: String,
    /// 1-based number of the current attempt.
    pub attempt: u32,
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Priority tier.
    pub priority: i64,
    /// Submission time in epoch milliseconds.
    pub created_at: i64,
}

impl JobMeta {
    /// Returns true if a failure of this attempt dead-letters the job.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the ready, priority or delayed structure.
    Pending,
    /// Popped by a worker, handler running.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Handler failed; scheduled to run again.
    Retry,
    /// Attempts exhausted; moved to the dead-letter list.
    Failed,
}

impl JobState {
    /// Returns whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Retry => write!(f, "retry"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a job written at every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    /// The job as of this transition.
    pub job: Job,
    /// State entered.
    pub status: JobState,
    /// Transition time in epoch milliseconds.
    pub updated_at: i64,
    /// Handler output on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Handler run time in milliseconds on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Handler error on retry or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    /// Creates a record for `job` entering `status` now.
    pub fn new(job: &Job, status: JobState) -> Self {
        Self {
            job: job.clone(),
            status,
            updated_at: now_millis(),
            result: None,
            duration: None,
            error: None,
        }
    }

    /// Attaches a handler result and run time.
    pub fn with_result(mut self, result: serde_json::Value, duration: Duration) -> Self {
        self.result = Some(result);
        self.duration = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Attaches a handler error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Caller-facing summary of a status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub status: JobState,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<StatusRecord> for JobStatusView {
    fn from(record: StatusRecord) -> Self {
        Self {
            status: record.status,
            updated_at: record.updated_at,
            result: record.result,
            error: record.error,
        }
    }
}

/// Exponential backoff between attempts: `2^attempts * base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplier applied to the power of two.
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given base.
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Backoff after the `attempts`-th failure.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let ms = 2u64
            .checked_pow(attempts)
            .and_then(|factor| factor.checked_mul(base_ms))
            .unwrap_or(u64::MAX);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_with(options: JobOptions) -> Job {
        Job::new("matches", json!({"user": "u1"}), &options)
    }

    #[test]
    fn test_job_new_defaults() {
        let job = job_with(JobOptions::default());

        assert!(!job.id.is_nil());
        assert_eq!(job.queue, "matches");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert!(job.execute_at.is_none());
        assert!(job.should_retry());
    }

    #[test]
    fn test_delayed_job_execute_at() {
        let job = job_with(JobOptions::new().with_delay_ms(2000));
        assert_eq!(job.execute_at, Some(job.created_at + 2000));
    }

    #[test]
    fn test_placement_precedence() {
        let delayed_and_prioritized =
            job_with(JobOptions::new().with_delay_ms(500).with_priority(9));
        assert!(matches!(
            Placement::for_submission(&delayed_and_prioritized),
            Placement::Delayed { .. }
        ));
        assert_eq!(
            Placement::for_promotion(&delayed_and_prioritized),
            Placement::Priority { priority: 9 }
        );

        let prioritized = job_with(JobOptions::new().with_priority(5));
        assert_eq!(
            Placement::for_submission(&prioritized),
            Placement::Priority { priority: 5 }
        );

        let plain = job_with(JobOptions::new());
        assert_eq!(Placement::for_submission(&plain), Placement::Ready);

        let negative = job_with(JobOptions::new().with_priority(-3));
        assert_eq!(Placement::for_submission(&negative), Placement::Ready);
    }

    #[test]
    fn test_job_attempts() {
        let mut job = job_with(JobOptions::new().with_max_attempts(2));

        assert_eq!(job.meta().attempt, 1);
        assert!(!job.meta().is_last_attempt());
        job.increment_attempts();
        assert!(job.should_retry());
        assert_eq!(job.remaining_attempts(), 1);
        assert!(job.meta().is_last_attempt());

        job.increment_attempts();
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 0);
    }

    #[test]
    fn test_job_wire_format_is_camel_case() {
        let job = job_with(JobOptions::new().with_delay_ms(10).with_max_attempts(5));
        let value = serde_json::to_value(&job).expect("job should serialize");

        assert_eq!(value["maxAttempts"], 5);
        assert_eq!(value["delayMs"], 10);
        assert!(value.get("createdAt").is_some());
        assert!(value.get("executeAt").is_some());
        assert!(value.get("retryAt").is_none());

        let decoded = Job::decode(&job.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_options_validation() {
        assert!(JobOptions::default().validate().is_ok());
        assert!(JobOptions::new().with_max_attempts(0).validate().is_err());
        assert!(JobOptions::new().with_delay_ms(u64::MAX).validate().is_err());
        assert!(JobOptions::new().with_priority(MAX_PRIORITY).validate().is_ok());
        assert!(JobOptions::new().with_priority(-MAX_PRIORITY).validate().is_ok());
        assert!(JobOptions::new().with_priority(MAX_PRIORITY + 1).validate().is_err());
        assert!(JobOptions::new().with_priority(i64::MIN).validate().is_err());
    }

    #[test]
    fn test_job_state_serialization() {
        assert_eq!(
            serde_json::to_string(&JobState::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(format!("{}", JobState::Retry), "retry");
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Retry.is_terminal());
    }

    #[test]
    fn test_status_record_view() {
        let job = job_with(JobOptions::default());
        let record = StatusRecord::new(&job, JobState::Completed)
            .with_result(json!({"matched": true}), Duration::from_millis(42));

        assert_eq!(record.duration, Some(42));
        let view = JobStatusView::from(record);
        assert_eq!(view.status, JobState::Completed);
        assert_eq!(view.result, Some(json!({"matched": true})));
        assert!(view.error.is_none());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));

        let fast = RetryPolicy::new(Duration::from_millis(5));
        assert_eq!(fast.backoff(2), Duration::from_millis(20));

        assert_eq!(policy.backoff(200), Duration::from_millis(u64::MAX));
    }
}

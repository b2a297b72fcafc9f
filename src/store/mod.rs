//! Durable store adapter.
//!
//! The engine keeps every piece of scheduling state in a shared key-value
//! store so that any number of worker processes can cooperate on the same
//! logical queues. This module defines the small set of primitives the engine
//! needs from that store:
//!
//! - ordered lists (append at the tail, pop from the head)
//! - sorted sets (score-ordered membership, range-by-score, pop-max)
//! - string values with expiry
//! - atomic multi-command execution ([`Batch`])
//!
//! Two backends are provided:
//!
//! - [`RedisStore`]: the production backend over a Redis connection manager
//! - [`MemoryStore`]: an in-process backend with the same semantics, used by
//!   tests and single-process embeddings
//!
//! # Atomic batches
//!
//! Every structural mutation (insert, remove, move) is expressed as one
//! [`Batch`]. A batch without a guard always applies. A batch with a
//! [`Guard`] applies only when the guard removes exactly one element; this is
//! what makes moves between structures safe when several workers race for the
//! same member: only the caller whose removal succeeded performs the insert.

mod memory;
mod redis_store;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use crate::error::StoreError;

/// A single write inside an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Append `value` at the tail of the list at `key`.
    PushBack { key: String, value: String },
    /// Add `member` to the sorted set at `key` with `score`.
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Set the string at `key`, expiring after `ttl_secs`.
    SetEx {
        key: String,
        value: String,
        ttl_secs: u64,
    },
    /// Delete `key`.
    Del { key: String },
}

impl Op {
    /// Returns the key this operation writes to.
    pub fn key(&self) -> &str {
        match self {
            Op::PushBack { key, .. }
            | Op::ZAdd { key, .. }
            | Op::SetEx { key, .. }
            | Op::Del { key } => key,
        }
    }
}

/// Precondition for a guarded [`Batch`]: a removal that must succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Remove `member` from the sorted set at `key`.
    ZRem { key: String, member: String },
    /// Remove the first occurrence of `value` from the list at `key`.
    LRem { key: String, value: String },
}

/// An ordered group of writes executed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub(crate) guard: Option<Guard>,
    pub(crate) ops: Vec<Op>,
}

impl Batch {
    /// Creates an empty, unguarded batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch that only applies if `guard` removes an element.
    pub fn guarded(guard: Guard) -> Self {
        Self {
            guard: Some(guard),
            ops: Vec::new(),
        }
    }

    /// Appends `value` to the list at `key`.
    pub fn push_back(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Op::PushBack {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Adds `member` to the sorted set at `key`.
    pub fn zadd(mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        self.ops.push(Op::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    /// Sets a string value with an expiry.
    pub fn set_ex(mut self, key: impl Into<String>, value: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(Op::SetEx {
            key: key.into(),
            value: value.into(),
            ttl_secs,
        });
        self
    }

    /// Deletes `key`.
    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Op::Del { key: key.into() });
        self
    }

    /// Appends an already-built operation.
    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    /// Returns the guard, if any.
    pub fn guard(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    /// Returns the writes in execution order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Returns true if the batch has neither a guard nor writes.
    pub fn is_empty(&self) -> bool {
        self.guard.is_none() && self.ops.is_empty()
    }
}

/// Primitives the engine needs from a shared key-value store.
///
/// Implementations must make every individual method atomic with respect to
/// other callers, and must execute a [`Batch`] as one indivisible unit.
#[async_trait]
pub trait Store: Send + Sync {
    /// Checks connectivity.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Appends `value` at the tail of a list, returning the new length.
    async fn push_back(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Removes and returns the head of a list.
    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive.
    /// Negative indices count from the tail.
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Returns the length of a list.
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Adds or re-scores a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Removes and returns the highest-scored member of a sorted set.
    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;

    /// Returns members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Returns the cardinality of a sorted set.
    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// Sets a string value that expires after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Deletes keys. Missing keys are ignored.
    async fn del(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Executes a batch atomically.
    ///
    /// Returns `false` only when the batch was guarded and the guard removed
    /// nothing, in which case no write was applied.
    async fn exec(&self, batch: Batch) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder_keeps_order() {
        let batch = Batch::new()
            .push_back("queue:a", "1")
            .zadd("queue:a:priority", "2", 5.0)
            .set_ex("job:1:status", "{}", 60)
            .del("queue:a:dlq");

        assert!(batch.guard().is_none());
        let keys: Vec<&str> = batch.ops().iter().map(Op::key).collect();
        assert_eq!(
            keys,
            vec!["queue:a", "queue:a:priority", "job:1:status", "queue:a:dlq"]
        );
    }

    #[test]
    fn test_guarded_batch() {
        let batch = Batch::guarded(Guard::ZRem {
            key: "queue:a:delayed".to_string(),
            member: "m".to_string(),
        })
        .push_back("queue:a", "m");

        assert!(matches!(batch.guard(), Some(Guard::ZRem { .. })));
        assert_eq!(batch.ops().len(), 1);
        assert!(!batch.is_empty());
        assert!(Batch::new().is_empty());
    }
}

//! In-process store backend.
//!
//! Mirrors the Redis semantics the engine relies on, including tie ordering
//! in sorted sets (equal scores ordered by member bytes) and lazy expiry of
//! string values. All state sits behind one lock, which makes every method
//! and every [`Batch`] trivially atomic.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Batch, Guard, Op, Store, StoreError};

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    strings: HashMap<String, (String, Instant)>,
}

impl State {
    fn push_back(&mut self, key: &str, value: &str) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        list.len()
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn lrem_first(&mut self, key: &str, value: &str) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|v| v == value) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            self.lists.remove(key);
        }
        true
    }

    fn set_ex(&mut self, key: &str, value: &str, ttl_secs: u64) {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.strings
            .insert(key.to_string(), (value.to_string(), expires_at));
    }

    fn del(&mut self, key: &str) {
        self.lists.remove(key);
        self.zsets.remove(key);
        self.strings.remove(key);
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::PushBack { key, value } => {
                self.push_back(key, value);
            }
            Op::ZAdd { key, member, score } => self.zadd(key, member, *score),
            Op::SetEx {
                key,
                value,
                ttl_secs,
            } => self.set_ex(key, value, *ttl_secs),
            Op::Del { key } => self.del(key),
        }
    }
}

fn score_order(a: &(&String, &f64), b: &(&String, &f64)) -> Ordering {
    a.1.partial_cmp(b.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(b.0))
}

/// Resolves Redis-style list indices (negative counts from the tail) into a
/// half-open range, or `None` if the range is empty.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize + 1))
}

/// Store backend that keeps all state in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        f(&mut state)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        Ok(self.with_state(|s| s.push_back(key, value)))
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_state(|s| {
            let list = s.lists.get_mut(key)?;
            let value = list.pop_front();
            if list.is_empty() {
                s.lists.remove(key);
            }
            value
        }))
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.with_state(|s| {
            let Some(list) = s.lists.get(key) else {
                return Vec::new();
            };
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..to).cloned().collect(),
                None => Vec::new(),
            }
        }))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.with_state(|s| s.lists.get(key).map_or(0, VecDeque::len)))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.with_state(|s| s.zadd(key, member, score));
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        Ok(self.with_state(|s| {
            let set = s.zsets.get(key)?;
            let (member, score) = set
                .iter()
                .max_by(score_order)
                .map(|(m, sc)| (m.clone(), *sc))?;
            s.zrem(key, &member);
            Some((member, score))
        }))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.with_state(|s| {
            let Some(set) = s.zsets.get(key) else {
                return Vec::new();
            };
            let mut members: Vec<(&String, &f64)> = set
                .iter()
                .filter(|(_, score)| **score >= min && **score <= max)
                .collect();
            members.sort_by(score_order);
            members
                .into_iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|(m, _)| m.clone())
                .collect()
        }))
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.with_state(|s| s.zsets.get(key).map_or(0, HashMap::len)))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.with_state(|s| s.set_ex(key, value, ttl_secs));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_state(|s| {
            let (value, expires_at) = s.strings.get(key)?;
            if *expires_at <= Instant::now() {
                s.strings.remove(key);
                return None;
            }
            Some(value.clone())
        }))
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        self.with_state(|s| keys.iter().for_each(|k| s.del(k)));
        Ok(())
    }

    async fn exec(&self, batch: Batch) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| {
            let admitted = match &batch.guard {
                Some(Guard::ZRem { key, member }) => s.zrem(key, member),
                Some(Guard::LRem { key, value }) => s.lrem_first(key, value),
                None => true,
            };
            if admitted {
                batch.ops.iter().for_each(|op| s.apply(op));
            }
            admitted
        }))
    }
}

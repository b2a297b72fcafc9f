//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use match_jobs::store::Batch;
use match_jobs::{
    EngineConfig, HandlerRegistry, JobEngine, MemoryStore, Store, StoreError, WorkerOptions,
};

/// Poll interval used by test engines.
pub const FAST_POLL: Duration = Duration::from_millis(20);

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Config with one fast poll loop per queue and a short backoff.
pub fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_backoff_base(Duration::from_millis(5))
        .with_worker_options(WorkerOptions::new(1).with_poll_interval(FAST_POLL))
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Engine over a fresh in-memory store.
pub fn memory_engine(handlers: HandlerRegistry) -> JobEngine {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    JobEngine::with_store(store, fast_config(), handlers)
}

/// Ordered record of handler invocations.
#[derive(Clone)]
pub struct InvocationLog<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> InvocationLog<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, entry: T) {
        self.entries.lock().expect("log lock poisoned").push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("log lock poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().expect("log lock poisoned").clone()
    }
}

/// In-memory store that fails chosen calls with a connection error.
///
/// Each armed failure is consumed by one call; after that the call goes
/// through to the wrapped store.
pub struct FailingStore {
    inner: MemoryStore,
    write_failures: Mutex<HashMap<String, usize>>,
    pop_failures: AtomicUsize,
    sweep_failures: AtomicUsize,
    injected: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            write_failures: Mutex::new(HashMap::new()),
            pop_failures: AtomicUsize::new(0),
            sweep_failures: AtomicUsize::new(0),
            injected: AtomicUsize::new(0),
        })
    }

    /// Fails the next `times` writes (batches or `set_ex`) touching `key`.
    pub fn fail_writes_to(&self, key: impl Into<String>, times: usize) {
        self.write_failures
            .lock()
            .expect("failure table lock poisoned")
            .insert(key.into(), times);
    }

    /// Fails the next `times` priority pops.
    pub fn fail_pops(&self, times: usize) {
        self.pop_failures.store(times, Ordering::SeqCst);
    }

    /// Fails the next `times` delayed-set range reads.
    pub fn fail_sweeps(&self, times: usize) {
        self.sweep_failures.store(times, Ordering::SeqCst);
    }

    /// Number of failures handed out so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_write_failure<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        let mut table = self.write_failures.lock().expect("failure table lock poisoned");
        for key in keys {
            if let Some(remaining) = table.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected_error(&self, call: &str) -> StoreError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        StoreError::Connection(format!("injected failure in {}", call))
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.inner.push_back(key, value).await
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.pop_front(key).await
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.list_range(key, start, stop).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.list_len(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.inner.zadd(key, member, score).await
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        if Self::take(&self.pop_failures) {
            return Err(self.injected_error("zpop_max"));
        }
        self.inner.zpop_max(key).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        if Self::take(&self.sweep_failures) {
            return Err(self.injected_error("zrange_by_score"));
        }
        self.inner.zrange_by_score(key, min, max, limit).await
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.zcard(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        if self.take_write_failure([key]) {
            return Err(self.injected_error("set_ex"));
        }
        self.inner.set_ex(key, value, ttl_secs).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        self.inner.del(keys).await
    }

    async fn exec(&self, batch: Batch) -> Result<bool, StoreError> {
        if self.take_write_failure(batch.ops().iter().map(|op| op.key())) {
            return Err(self.injected_error("exec"));
        }
        self.inner.exec(batch).await
    }
}

/// Engine over a store that can be told to fail.
pub fn failing_engine(store: &Arc<FailingStore>, handlers: HandlerRegistry) -> JobEngine {
    let store: Arc<dyn Store> = store.clone();
    JobEngine::with_store(store, fast_config(), handlers)
}

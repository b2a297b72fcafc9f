//! Job handlers and the handler registry.
//!
//! A handler owns the semantics of one queue: it decodes the payload, does
//! the work and returns a JSON result. The engine only routes the outcome.
//! Handlers must tolerate being invoked more than once for the same logical
//! work and must not assume a job is ever redelivered after a crash.
//!
//! The registry is built once and is read-only afterwards; every worker loop
//! holds a cheap clone of it.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::job::JobMeta;
use crate::error::{validate_queue_name, RegistryError};

/// Outcome of a handler invocation.
pub type HandlerResult = anyhow::Result<serde_json::Value>;

/// Executes jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles one job. Any error counts as a failed attempt.
    async fn handle(&self, payload: serde_json::Value, meta: JobMeta) -> HandlerResult;
}

/// Adapter from a typed async closure to [`JobHandler`].
///
/// Created with [`handler_fn`].
pub struct FnHandler<T, R, F> {
    f: F,
    _types: PhantomData<fn(T) -> R>,
}

/// Wraps an async closure over a typed payload as a [`JobHandler`].
///
/// The payload is decoded into `T` before the closure runs; a payload that
/// does not decode is a failed attempt like any other error. The closure's
/// output is encoded back to JSON and stored with the completed status.
///
/// ```ignore
/// let handler = handler_fn(|swipe: Swipe, meta: JobMeta| async move {
///     let matched = create_match(&swipe).await?;
///     anyhow::Ok(MatchOutcome { matched, attempt: meta.attempt })
/// });
/// ```
pub fn handler_fn<T, R, F, Fut>(f: F) -> FnHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T, JobMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    FnHandler {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<T, R, F, Fut> JobHandler for FnHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T, JobMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value, meta: JobMeta) -> HandlerResult {
        let input: T = serde_json::from_value(payload)
            .with_context(|| format!("payload does not match handler for queue '{}'", meta.queue))?;
        let output = (self.f)(input, meta).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Immutable map from queue name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Starts building a registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Returns the handler for `queue`.
    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Returns whether `queue` has a handler.
    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Returns the registered queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistryBuilder {
    /// Registers the handler for `queue`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateHandler` if `queue` already has one.
    pub fn register(
        mut self,
        queue: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Result<Self, RegistryError> {
        let queue = queue.into();
        if !validate_queue_name(&queue) {
            return Err(RegistryError::InvalidQueueName(queue));
        }
        if self.handlers.contains_key(&queue) {
            return Err(RegistryError::DuplicateHandler(queue));
        }
        self.handlers.insert(queue, Arc::new(handler));
        Ok(self)
    }

    /// Freezes the registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    struct Swipe {
        from: String,
        to: String,
    }

    fn meta(queue: &str) -> JobMeta {
        JobMeta {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            attempt: 1,
            max_attempts: 3,
            priority: 0,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_handler_fn_decodes_payload() {
        let handler = handler_fn(|swipe: Swipe, meta: JobMeta| async move {
            anyhow::Ok(json!({
                "pair": format!("{}-{}", swipe.from, swipe.to),
                "attempt": meta.attempt,
            }))
        });

        let result = handler
            .handle(json!({"from": "a", "to": "b"}), meta("matches"))
            .await
            .expect("handler should succeed");
        assert_eq!(result, json!({"pair": "a-b", "attempt": 1}));
    }

    #[tokio::test]
    async fn test_handler_fn_rejects_mismatched_payload() {
        let handler = handler_fn(|_: Swipe, _: JobMeta| async move { anyhow::Ok(()) });

        let err = handler
            .handle(json!("not a swipe"), meta("matches"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("matches"));
    }

    #[tokio::test]
    async fn test_handler_fn_propagates_errors() {
        let handler = handler_fn(|_: serde_json::Value, _: JobMeta| async move {
            Err::<(), _>(anyhow::anyhow!("provider unavailable"))
        });

        let err = handler.handle(json!({}), meta("push")).await.unwrap_err();
        assert_eq!(err.to_string(), "provider unavailable");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let noop = || handler_fn(|_: serde_json::Value, _: JobMeta| async move { anyhow::Ok(()) });

        let registry = HandlerRegistry::builder()
            .register("matches", noop())
            .and_then(|b| b.register("cleanup", noop()))
            .expect("distinct queues register")
            .build();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("matches"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.queues(), vec!["cleanup", "matches"]);

        let err = HandlerRegistry::builder()
            .register("matches", noop())
            .and_then(|b| b.register("matches", noop()))
            .err()
            .expect("duplicate should fail");
        assert!(matches!(err, RegistryError::DuplicateHandler(q) if q == "matches"));
    }

    #[test]
    fn test_registry_rejects_bad_names() {
        let err = HandlerRegistry::builder()
            .register(
                "",
                handler_fn(|_: serde_json::Value, _: JobMeta| async move { anyhow::Ok(()) }),
            )
            .err()
            .expect("empty name should fail");
        assert!(matches!(err, RegistryError::InvalidQueueName(_)));
    }
}

//! Bounded retry for idempotent reads.
//!
//! Only `query` and `health_check` are retried. Mutations and procedures pass
//! straight through: retrying a bid acceptance or a status advance after an
//! ambiguous failure could apply it twice.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Collection, Filter, Procedure, Query, Store, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

fn classify(err: StoreError) -> backoff::Error<StoreError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Wraps a store and retries its idempotent reads on transient failures.
#[derive(Clone)]
pub struct ReadRetry {
    inner: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl ReadRetry {
    pub fn new(inner: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Store for ReadRetry {
    fn backend_tag(&self) -> &'static str {
        self.inner.backend_tag()
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Value>> {
        let inner = &self.inner;
        retry(self.policy.backoff(), move || async move {
            inner.query(query).await.map_err(|e| {
                if e.is_transient() {
                    tracing::warn!(
                        collection = %query.collection,
                        error = %e,
                        "Transient read failure, retrying"
                    );
                }
                classify(e)
            })
        })
        .await
    }

    async fn insert(&self, collection: Collection, row: Value) -> StoreResult<Value> {
        self.inner.insert(collection, row).await
    }

    async fn update(
        &self,
        collection: Collection,
        id: Uuid,
        patch: Value,
        precondition: Option<&Filter>,
    ) -> StoreResult<Value> {
        self.inner.update(collection, id, patch, precondition).await
    }

    async fn delete(
        &self,
        collection: Collection,
        id: Uuid,
        precondition: Option<&Filter>,
    ) -> StoreResult<()> {
        self.inner.delete(collection, id, precondition).await
    }

    async fn transaction(&self, procedure: Procedure) -> StoreResult<Value> {
        self.inner.transaction(procedure).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        let inner = &self.inner;
        retry(self.policy.backoff(), move || async move {
            inner.health_check().await.map_err(classify)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn reads_recover_from_transient_failures() {
        let memory = Arc::new(MemoryStore::new());
        memory
            .insert(Collection::Notifications, json!({ "user_id": Uuid::new_v4() }))
            .await
            .expect("seed");
        memory.fail_next_reads(2);

        let store = ReadRetry::new(memory.clone(), fast_policy());
        let rows = store
            .query(&Query::new(Collection::Notifications))
            .await
            .expect("query after retries");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn mutations_are_not_retried() {
        let memory = Arc::new(MemoryStore::new());
        memory.set_offline(true);
        let store = ReadRetry::new(memory.clone(), fast_policy());

        let result = store
            .insert(Collection::Notifications, json!({ "user_id": Uuid::new_v4() }))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        memory.set_offline(false);
        assert_eq!(memory.row_count(Collection::Notifications), 0);
    }
}

//! Shared data area — per-job scratch space in the backing KV store.
//!
//! Steps of the same job may execute on different workers; the shared data
//! area (a JSON map per job id) and the shared stack (a LIFO per job id)
//! are how they exchange intermediate results. Every write refreshes the
//! configured TTL; the owning job deletes both when it reaches a terminal
//! state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::KvError;
use crate::kv::KvStore;

/// Handle on the shared data area and shared stack.
pub struct SharedData {
    kv: Arc<dyn KvStore>,
    data_prefix: String,
    stack_prefix: String,
    ttl: Duration,
}

impl SharedData {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            data_prefix: config.data_prefix.clone(),
            stack_prefix: config.stack_prefix.clone(),
            ttl: config.shared_ttl,
        }
    }

    fn data_key(&self, job_id: &str) -> String {
        format!("{}{}", self.data_prefix, job_id)
    }

    fn stack_key(&self, job_id: &str) -> String {
        format!("{}{}", self.stack_prefix, job_id)
    }

    fn counter_key(&self, job_id: &str, name: &str) -> String {
        format!("{}{}:{}", self.data_prefix, job_id, name)
    }

    /// Read the whole shared map for `job_id` (empty if never written).
    pub async fn get(&self, job_id: &str) -> Result<Map<String, Value>, KvError> {
        match self.kv.get(&self.data_key(job_id)).await? {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => {
                tracing::warn!(job_id = %job_id, "Shared data is not a map: {other}");
                Ok(Map::new())
            }
            None => Ok(Map::new()),
        }
    }

    /// Merge `partial` into the shared map for `job_id` and refresh the TTL.
    ///
    /// This is a read-modify-write: two contexts merging into the same job
    /// id concurrently can lose one writer's keys. That relaxation is part
    /// of the contract; callers that need a stronger guarantee serialize
    /// their writes or use [`SharedData::counter_incr`].
    pub async fn set(
        &self,
        job_id: &str,
        partial: Map<String, Value>,
    ) -> Result<Map<String, Value>, KvError> {
        let mut current = self.get(job_id).await?;
        for (key, value) in partial {
            current.insert(key, value);
        }
        self.kv
            .set(
                &self.data_key(job_id),
                Value::Object(current.clone()),
                Some(self.ttl),
            )
            .await?;
        tracing::debug!(job_id = %job_id, keys = current.len(), "Shared data updated");
        Ok(current)
    }

    /// Drop the shared map for `job_id`.
    pub async fn delete(&self, job_id: &str) -> Result<bool, KvError> {
        self.kv.delete(&self.data_key(job_id)).await
    }

    /// Atomically add `delta` to the named per-job counter.
    ///
    /// Unlike [`SharedData::set`] this cannot lose updates under
    /// concurrent writers.
    pub async fn counter_incr(
        &self,
        job_id: &str,
        name: &str,
        delta: i64,
    ) -> Result<i64, KvError> {
        self.kv.incr(&self.counter_key(job_id, name), delta).await
    }

    /// Push a value onto the job's shared stack, refreshing the TTL.
    pub async fn stack_push(&self, job_id: &str, value: Value) -> Result<(), KvError> {
        self.kv
            .list_push(&self.stack_key(job_id), value, Some(self.ttl))
            .await
    }

    /// Pop the most recent value off the job's shared stack.
    pub async fn stack_pop(&self, job_id: &str) -> Result<Option<Value>, KvError> {
        self.kv.list_pop(&self.stack_key(job_id)).await
    }

    /// Drop the job's shared stack.
    pub async fn stack_delete(&self, job_id: &str) -> Result<bool, KvError> {
        self.kv.list_delete(&self.stack_key(job_id)).await
    }

    /// Tear down everything the job owns in the shared area. Called when
    /// the job reaches a terminal state.
    pub async fn teardown(&self, job_id: &str) -> Result<(), KvError> {
        self.delete(job_id).await?;
        self.stack_delete(job_id).await?;
        Ok(())
    }
}

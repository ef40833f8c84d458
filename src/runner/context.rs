//! Per-invocation execution context.
//!
//! Built once at invocation entry and passed by reference through the step
//! loop, never stored in ambient thread-local state, so pooled worker
//! threads cannot leak one invocation's identity into another.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{Error, StepError};
use crate::result::ResultStore;
use crate::runner::step::Params;
use crate::shared::SharedData;

/// Identity triple of the caller that submitted the work.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user: Option<String>,
    pub origin: Option<String>,
    /// Reference to a stored credential, never the credential itself.
    pub credential: Option<String>,
}

/// Execution context for one task invocation.
///
/// Owned exclusively by the invocation that created it. Steps reach the
/// shared data area and the result store through it.
pub struct ExecutionContext {
    pub identity: Identity,
    pub entity_class: Option<String>,
    pub entity_id: Option<String>,
    pub operation: Option<String>,
    /// Id of the unit this invocation executes; the result record target.
    pub unit_id: String,
    /// Shared-data key for this invocation. Defaults to the unit's own id;
    /// a composite job passes its root id down so all children share one
    /// data area.
    pub job_id: String,
    pub poll_interval: Duration,
    started: Instant,
    shared: Arc<SharedData>,
    results: Arc<ResultStore>,
}

fn pop_string(params: &mut Params, key: &str) -> Option<String> {
    match params.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

impl ExecutionContext {
    /// Build a context from the invocation parameters, popping the
    /// identity and entity fields so steps only see business parameters.
    pub fn from_params(
        unit_id: &str,
        params: &mut Params,
        shared: Arc<SharedData>,
        results: Arc<ResultStore>,
        default_poll: Duration,
    ) -> Self {
        let identity = Identity {
            user: pop_string(params, "user"),
            origin: pop_string(params, "origin"),
            credential: pop_string(params, "credential"),
        };
        let entity_class = pop_string(params, "entity_class");
        let entity_id = pop_string(params, "entity_id");
        let operation = pop_string(params, "operation");
        let job_id = pop_string(params, "job_id").unwrap_or_else(|| unit_id.to_string());
        let poll_interval = params
            .remove("poll_interval_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(default_poll);

        Self {
            identity,
            entity_class,
            entity_id,
            operation,
            unit_id: unit_id.to_string(),
            job_id,
            poll_interval,
            started: Instant::now(),
            shared,
            results,
        }
    }

    pub fn shared(&self) -> &SharedData {
        &self.shared
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Monotonic time since the invocation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Poll another unit's record until it is terminal, cooperatively
    /// yielding between polls. Step-friendly: failures arrive as
    /// [`StepError`] so step bodies can use `?` directly.
    pub async fn wait_for(&self, task_id: &str) -> Result<Value, StepError> {
        match self.results.wait(task_id, self.poll_interval).await {
            Ok(value) => Ok(value),
            Err(Error::Remote(err)) => Err(StepError::Remote(err)),
            Err(Error::Kv(err)) => Err(StepError::Kv(err)),
            Err(other) => Err(StepError::failed("wait_for", other.to_string())),
        }
    }
}

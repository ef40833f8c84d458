//! Step abstraction and instrumentation.
//!
//! A step is one ordered sub-operation inside a single task invocation.
//! Steps are composed into a task either by name (resolved through the
//! [`StepRegistry`](crate::runner::StepRegistry) at run time) or as direct
//! values. [`instrument`] is the explicit middleware that records a step's
//! lifecycle into the result record before re-raising its errors.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StepError;
use crate::result::RecordPatch;
use crate::runner::context::ExecutionContext;

/// Parameters passed through a task invocation, mutated by its steps.
pub type Params = Map<String, Value>;

/// What a step returns: a JSON value recorded as its output.
pub type StepResult = Result<Value, StepError>;

/// One step of a task.
#[async_trait]
pub trait StepFn: Send + Sync {
    async fn call(
        &self,
        ctx: &ExecutionContext,
        step_id: u32,
        params: &mut Params,
    ) -> StepResult;
}

/// Shared handle on a step implementation.
pub type Step = Arc<dyn StepFn>;

/// Reference to a step inside a task specification.
#[derive(Clone)]
pub enum StepRef {
    /// Resolved through the registry when the task runs; an unknown name
    /// is a fatal configuration error.
    Named(String),
    /// Supplied directly by the caller.
    Inline { name: String, step: Step },
}

impl StepRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Inline { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for StepRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, "StepRef::Named({name})"),
            Self::Inline { name, .. } => write!(f, "StepRef::Inline({name})"),
        }
    }
}

struct FnStep<F>(F);

#[async_trait]
impl<F> StepFn for FnStep<F>
where
    F: for<'a> Fn(&'a ExecutionContext, u32, &'a mut Params) -> BoxFuture<'a, StepResult>
        + Send
        + Sync,
{
    async fn call(
        &self,
        ctx: &ExecutionContext,
        step_id: u32,
        params: &mut Params,
    ) -> StepResult {
        (self.0)(ctx, step_id, params).await
    }
}

/// Wrap a free function (or boxed-future closure) as a [`Step`].
pub fn from_fn<F>(f: F) -> Step
where
    F: for<'a> Fn(&'a ExecutionContext, u32, &'a mut Params) -> BoxFuture<'a, StepResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnStep(f))
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Success,
    Failure,
}

/// In-invocation record of one step's execution.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_id: u32,
    pub name: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn running(step_id: u32, name: impl Into<String>) -> Self {
        Self {
            step_id,
            name: name.into(),
            status: StepStatus::Running,
            output: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, output: Value) {
        self.status = StepStatus::Success;
        self.output = Some(output);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failure;
        self.error = Some(error.into());
    }
}

struct Instrumented {
    name: String,
    inner: Step,
}

#[async_trait]
impl StepFn for Instrumented {
    async fn call(
        &self,
        ctx: &ExecutionContext,
        step_id: u32,
        params: &mut Params,
    ) -> StepResult {
        let task_id = ctx.unit_id.clone();
        ctx.results()
            .store(
                &task_id,
                RecordPatch::message(format!("step[{step_id}] {}: running", self.name)),
            )
            .await?;

        match self.inner.call(ctx, step_id, params).await {
            Ok(value) => {
                ctx.results()
                    .store(
                        &task_id,
                        RecordPatch::message(format!(
                            "step[{step_id}] {}: success",
                            self.name
                        )),
                    )
                    .await?;
                tracing::debug!(task_id = %task_id, step = %self.name, "Step succeeded");
                Ok(value)
            }
            Err(err) => {
                // Recording must not mask the step's own failure.
                if let Err(store_err) = ctx
                    .results()
                    .store(
                        &task_id,
                        RecordPatch::message(format!(
                            "step[{step_id}] {}: failure: {err}",
                            self.name
                        )),
                    )
                    .await
                {
                    tracing::error!(task_id = %task_id, error = %store_err, "Step failure record write failed");
                }
                tracing::warn!(task_id = %task_id, step = %self.name, error = %err, "Step failed");
                Err(err)
            }
        }
    }
}

/// Wrap a step so its entry, output, and failure are recorded in the
/// result record's trace before any error is re-raised. Steps never
/// swallow exceptions; this only annotates them.
pub fn instrument(name: impl Into<String>, step: Step) -> Step {
    Arc::new(Instrumented {
        name: name.into(),
        inner: step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_record_lifecycle() {
        let mut record = StepRecord::running(1, "mul");
        assert_eq!(record.status, StepStatus::Running);

        record.succeed(Value::from(5));
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(record.output, Some(Value::from(5)));

        let mut failed = StepRecord::running(2, "sum");
        failed.fail("boom");
        assert_eq!(failed.status, StepStatus::Failure);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn step_ref_names() {
        let named = StepRef::Named("mul".to_string());
        assert_eq!(named.name(), "mul");
        assert_eq!(format!("{named:?}"), "StepRef::Named(mul)");
    }
}

//! The ordered-step execution loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::error::{traceback_of, Error};
use crate::result::{RecordPatch, ResultStore, TaskKind, TaskStatus};
use crate::runner::context::ExecutionContext;
use crate::runner::registry::StepRegistry;
use crate::runner::step::{instrument, Params, Step, StepRecord, StepRef};
use crate::shared::SharedData;

/// Name of the mandatory leading marker step.
pub const START_STEP: &str = "start_step";
/// Name of the mandatory trailing marker step.
pub const END_STEP: &str = "end_step";

/// Specification of one runnable task: an ordered step list, plus an
/// optional whole-task body for units whose work is not expressible as
/// flat steps.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub steps: Vec<StepRef>,
    pub body: Option<Step>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Task,
            steps: Vec::new(),
            body: None,
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Append a step resolved by name through the registry.
    pub fn step(mut self, name: impl Into<String>) -> Self {
        self.steps.push(StepRef::Named(name.into()));
        self
    }

    /// Append a step supplied directly.
    pub fn inline_step(mut self, name: impl Into<String>, step: Step) -> Self {
        self.steps.push(StepRef::Inline {
            name: name.into(),
            step,
        });
        self
    }

    /// Set the whole-task body override.
    pub fn body(mut self, body: Step) -> Self {
        self.body = Some(body);
        self
    }
}

/// Scoped backing-store session held for the duration of one invocation.
///
/// Exclusively owned by the invocation that opened it and released
/// unconditionally on every exit path, including errors. Dropping an
/// unclosed session is a bug in the runner, not in callers.
pub struct StoreSession {
    task_id: String,
    opened: Instant,
    closed: bool,
}

impl StoreSession {
    pub fn open(task_id: &str) -> Self {
        tracing::debug!(task_id = %task_id, "Store session opened");
        Self {
            task_id: task_id.to_string(),
            opened: Instant::now(),
            closed: false,
        }
    }

    pub fn close(mut self) {
        self.closed = true;
        tracing::debug!(
            task_id = %self.task_id,
            held_ms = self.opened.elapsed().as_millis() as u64,
            "Store session closed"
        );
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(task_id = %self.task_id, "Store session dropped without close");
        }
    }
}

/// Outcome of a successful invocation.
#[derive(Debug)]
pub struct RunReport {
    /// The last step's (or the body override's) return value.
    pub result: Value,
    /// Per-step records, including the start/end markers.
    pub steps: Vec<StepRecord>,
}

/// Executes one task invocation: context setup, session, start marker,
/// ordered steps, optional body override, end marker, terminal record.
pub struct StepRunner {
    registry: Arc<StepRegistry>,
    results: Arc<ResultStore>,
    shared: Arc<SharedData>,
    worker_hostname: String,
    poll_interval: Duration,
}

impl StepRunner {
    pub fn new(
        registry: Arc<StepRegistry>,
        results: Arc<ResultStore>,
        shared: Arc<SharedData>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            results,
            shared,
            worker_hostname: config.worker_hostname.clone(),
            poll_interval: config.poll_interval,
        }
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    pub fn shared(&self) -> &Arc<SharedData> {
        &self.shared
    }

    /// Run `spec` as unit `task_id` with the given parameters.
    ///
    /// On failure the exception is captured into the record (state
    /// `FAILURE`, serialized traceback) and then re-raised so the
    /// execution engine's own failure handling observes it too.
    pub async fn run(
        &self,
        task_id: &str,
        spec: &TaskSpec,
        mut params: Params,
    ) -> Result<RunReport, Error> {
        let ctx = ExecutionContext::from_params(
            task_id,
            &mut params,
            Arc::clone(&self.shared),
            Arc::clone(&self.results),
            self.poll_interval,
        );

        let session = StoreSession::open(task_id);
        let outcome = self.execute(&ctx, task_id, spec, &mut params).await;
        session.close();

        match outcome {
            Ok(report) => Ok(report),
            Err(err) => {
                let traceback = traceback_of(&err);
                let failure = RecordPatch {
                    state: Some(TaskStatus::Failure),
                    traceback: Some(traceback),
                    duration: Some(ctx.elapsed().as_secs_f64()),
                    trace: Some(format!("task failed: {err}")),
                    ..RecordPatch::default()
                };
                if let Err(store_err) = self.results.store(task_id, failure).await {
                    tracing::error!(
                        task_id = %task_id,
                        error = %store_err,
                        "Failed to persist failure record"
                    );
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        task_id: &str,
        spec: &TaskSpec,
        params: &mut Params,
    ) -> Result<RunReport, Error> {
        self.results
            .store(
                task_id,
                RecordPatch {
                    name: Some(spec.name.clone()),
                    kind: Some(spec.kind),
                    worker: Some(self.worker_hostname.clone()),
                    kwargs: Some(Value::Object(params.clone())),
                    state: Some(TaskStatus::Started),
                    timestamp: Some(Utc::now()),
                    trace: Some("task started".to_string()),
                    ..RecordPatch::default()
                },
            )
            .await
            .map_err(Error::Kv)?;

        let mut steps_run = Vec::new();
        self.marker(task_id, 0, START_STEP, &mut steps_run).await?;

        let resolved = self.registry.resolve(&spec.steps).await?;
        let mut last = Value::Null;
        let mut next_id: u32 = 1;

        for (name, step) in resolved {
            let step_id = next_id;
            next_id += 1;
            let mut record = StepRecord::running(step_id, name.as_str());
            let instrumented = instrument(name, step);
            match instrumented.call(ctx, step_id, params).await {
                Ok(value) => {
                    record.succeed(value.clone());
                    steps_run.push(record);
                    last = value;
                }
                Err(err) => {
                    record.fail(err.to_string());
                    steps_run.push(record);
                    return Err(err.into());
                }
            }
        }

        if let Some(body) = &spec.body {
            let step_id = next_id;
            next_id += 1;
            let instrumented = instrument("task_body", Arc::clone(body));
            last = instrumented.call(ctx, step_id, params).await?;
        }

        self.marker(task_id, next_id, END_STEP, &mut steps_run).await?;

        let terminal = TaskStatus::resolve_terminal(spec.kind, TaskStatus::Success);
        self.results
            .store(
                task_id,
                RecordPatch {
                    state: Some(terminal),
                    result: Some(last.clone()),
                    duration: Some(ctx.elapsed().as_secs_f64()),
                    trace: Some("task completed".to_string()),
                    ..RecordPatch::default()
                },
            )
            .await
            .map_err(Error::Kv)?;

        Ok(RunReport {
            result: last,
            steps: steps_run,
        })
    }

    /// Write a no-op marker step as SUCCESS for trace symmetry.
    async fn marker(
        &self,
        task_id: &str,
        step_id: u32,
        name: &str,
        steps_run: &mut Vec<StepRecord>,
    ) -> Result<(), Error> {
        self.results
            .store(
                task_id,
                RecordPatch::message(format!("step[{step_id}] {name}: success")),
            )
            .await
            .map_err(Error::Kv)?;
        let mut record = StepRecord::running(step_id, name);
        record.succeed(Value::Null);
        steps_run.push(record);
        Ok(())
    }
}

//! In-process execution engine.
//!
//! Executes registered handlers on tokio tasks and reports their
//! lifecycle into the result store, the same observable contract a
//! distributed engine provides: pre-run marks `STARTED`, post-run stores
//! the terminal state through `resolve_terminal` (so a `JOB` root parks
//! at `PROGRESS` until its end bracket reports), failures store the
//! serialized traceback, and completed units are filed into their
//! parent's record for child aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::canvas::{build_job, BodyItem, Canvas, Signature};
use crate::config::Config;
use crate::engine::{ExecutionEngine, SubmitOptions};
use crate::error::{traceback_of, EngineError, Error};
use crate::result::{RecordPatch, ResultStore, TaskKind, TaskStatus};
use crate::runner::{Params, StepRunner, TaskSpec};
use crate::shared::SharedData;

/// Task name of the leading bracket unit.
pub const JOB_START: &str = "job.start";
/// Task name of the trailing bracket unit.
pub const JOB_END: &str = "job.end";

/// Executes one named unit in-process.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task_id: &str, args: &[Value], kwargs: Params) -> Result<Value, Error>;

    fn kind(&self) -> TaskKind {
        TaskKind::Task
    }
}

/// Runs a [`TaskSpec`] through the step runner.
struct StepTaskHandler {
    spec: TaskSpec,
    runner: Arc<StepRunner>,
}

#[async_trait]
impl TaskHandler for StepTaskHandler {
    async fn run(&self, task_id: &str, _args: &[Value], kwargs: Params) -> Result<Value, Error> {
        let report = self.runner.run(task_id, &self.spec, kwargs).await?;
        Ok(report.result)
    }

    fn kind(&self) -> TaskKind {
        self.spec.kind
    }
}

/// No-op marker used for the start/end bracket units.
struct MarkerHandler;

#[async_trait]
impl TaskHandler for MarkerHandler {
    async fn run(&self, _task_id: &str, _args: &[Value], _kwargs: Params) -> Result<Value, Error> {
        Ok(Value::Null)
    }
}

/// In-process [`ExecutionEngine`].
pub struct LocalEngine {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    runner: Arc<StepRunner>,
    results: Arc<ResultStore>,
    shared: Arc<SharedData>,
    running: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    worker_hostname: String,
    default_queue: String,
    poll_interval: Duration,
}

impl LocalEngine {
    pub fn new(runner: Arc<StepRunner>, config: &Config) -> Arc<Self> {
        let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(JOB_START.to_string(), Arc::new(MarkerHandler));
        handlers.insert(JOB_END.to_string(), Arc::new(MarkerHandler));

        Arc::new(Self {
            handlers: RwLock::new(handlers),
            results: Arc::clone(runner.results()),
            shared: Arc::clone(runner.shared()),
            runner,
            running: Arc::new(RwLock::new(HashMap::new())),
            worker_hostname: config.worker_hostname.clone(),
            default_queue: config.default_queue.clone(),
            poll_interval: config.poll_interval,
        })
    }

    /// Register a handler under `name`, replacing any previous one.
    pub async fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(name.to_string(), handler);
        tracing::debug!("Registered task handler: {}", name);
    }

    /// Register a step-list task under its spec name.
    pub async fn register_task(&self, spec: TaskSpec) {
        let name = spec.name.clone();
        let handler = Arc::new(StepTaskHandler {
            spec,
            runner: Arc::clone(&self.runner),
        });
        self.register(&name, handler).await;
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        self.running.read().await.contains_key(task_id)
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Submit a composite job: a body of units and parallel groups,
    /// bracketed by the start/end marker units. Returns the root unit id
    /// immediately; children execute asynchronously and the root record
    /// parks at `PROGRESS` until the end bracket reports completion.
    pub async fn run_job(
        self: &Arc<Self>,
        name: &str,
        body: Vec<BodyItem>,
        params: Params,
    ) -> Result<String, Error> {
        let root_id = Uuid::new_v4().to_string();
        self.results
            .store(
                &root_id,
                RecordPatch {
                    name: Some(name.to_string()),
                    kind: Some(TaskKind::Job),
                    worker: Some(self.worker_hostname.clone()),
                    kwargs: Some(Value::Object(params.clone())),
                    state: Some(TaskStatus::Started),
                    timestamp: Some(Utc::now()),
                    trace: Some("job started".to_string()),
                    ..RecordPatch::default()
                },
            )
            .await
            .map_err(Error::Kv)?;

        let canvas = build_job(Signature::new(JOB_START), body, Signature::new(JOB_END));

        // The root body's only work is scheduling its children; its own
        // "success" must not read as job completion, so the stored state
        // is resolved through the kind-aware rule before the children run.
        let parked = TaskStatus::resolve_terminal(TaskKind::Job, TaskStatus::Success);
        self.results
            .store(
                &root_id,
                RecordPatch {
                    state: Some(parked),
                    trace: Some("job body returned; awaiting end bracket".to_string()),
                    ..RecordPatch::default()
                },
            )
            .await
            .map_err(Error::Kv)?;

        let engine = Arc::clone(self);
        let job_id = root_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = engine.execute_node(&canvas, &job_id, &params).await;
            match outcome {
                Ok(last) => {
                    tracing::info!(job_id = %job_id, "Job completed");
                    if let Err(e) = engine
                        .results
                        .store(
                            &job_id,
                            RecordPatch {
                                state: Some(TaskStatus::Success),
                                result: Some(last),
                                trace: Some("job completed".to_string()),
                                ..RecordPatch::default()
                            },
                        )
                        .await
                    {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to store job success");
                    }
                }
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "Job failed");
                    if let Err(e) = engine
                        .results
                        .store(
                            &job_id,
                            RecordPatch {
                                state: Some(TaskStatus::Failure),
                                traceback: Some(traceback_of(&err)),
                                trace: Some(format!("job failed: {err}")),
                                ..RecordPatch::default()
                            },
                        )
                        .await
                    {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to store job failure");
                    }
                }
            }
            // The job owns its shared area; tear it down at terminal state.
            if let Err(e) = engine.shared.teardown(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Shared data teardown failed");
            }
            engine.running.write().await.remove(&job_id);
        });
        self.running.write().await.insert(root_id.clone(), handle);

        Ok(root_id)
    }

    fn execute_node<'a>(
        &'a self,
        node: &'a Canvas,
        root_id: &'a str,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            match node {
                Canvas::Unit(sig) => self.run_unit(sig, root_id, params).await,
                Canvas::Chain(nodes) => {
                    let mut last = Value::Null;
                    for inner in nodes {
                        last = self.execute_node(inner, root_id, params).await?;
                    }
                    Ok(last)
                }
                Canvas::Group(sigs) => {
                    let outputs = self.run_group(sigs, root_id, params).await?;
                    Ok(Value::Array(outputs))
                }
                Canvas::Chord { header, callback } => {
                    let outputs = self.run_group(header, root_id, params).await?;
                    // The join continuation reads the fan-out results off
                    // the job's shared stack.
                    self.shared
                        .stack_push(root_id, Value::Array(outputs))
                        .await
                        .map_err(Error::Kv)?;
                    self.execute_node(callback, root_id, params).await
                }
            }
        })
    }

    async fn run_group(
        &self,
        sigs: &[Signature],
        root_id: &str,
        params: &Params,
    ) -> Result<Vec<Value>, Error> {
        let branches = sigs.iter().map(|sig| self.run_unit(sig, root_id, params));
        join_all(branches).await.into_iter().collect()
    }

    /// Submit one unit of the job and wait for its terminal record.
    async fn run_unit(
        &self,
        sig: &Signature,
        root_id: &str,
        params: &Params,
    ) -> Result<Value, Error> {
        let mut kwargs = params.clone();
        for (key, value) in &sig.kwargs {
            kwargs.insert(key.clone(), value.clone());
        }
        // All children of the job share the root's data area.
        kwargs.insert("job_id".to_string(), Value::String(root_id.to_string()));

        let options = SubmitOptions {
            queue: sig
                .options
                .get("queue")
                .and_then(|v| v.as_str())
                .map(String::from),
            parent_id: Some(root_id.to_string()),
            ..SubmitOptions::default()
        };
        let task_id = self
            .submit(&sig.task, sig.args.clone(), kwargs, options)
            .await
            .map_err(Error::Engine)?;
        self.results.wait(&task_id, self.poll_interval).await
    }
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    async fn submit(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Params,
        options: SubmitOptions,
    ) -> Result<String, EngineError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered {
                name: name.to_string(),
            })?;

        let task_id = options
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let kind = options.kind.unwrap_or_else(|| handler.kind());
        let queue = options
            .queue
            .unwrap_or_else(|| self.default_queue.clone());

        self.results
            .store(
                &task_id,
                RecordPatch {
                    name: Some(name.to_string()),
                    kind: Some(kind),
                    worker: Some(self.worker_hostname.clone()),
                    args: Some(Value::Array(args.clone())),
                    kwargs: Some(Value::Object(kwargs.clone())),
                    state: Some(TaskStatus::Pending),
                    trace: Some(format!("received on queue {queue}")),
                    ..RecordPatch::default()
                },
            )
            .await
            .map_err(|e| EngineError::SubmitFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let results = Arc::clone(&self.results);
        let running = Arc::clone(&self.running);
        let parent_id = options.parent_id;
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = results
                .store(
                    &id,
                    RecordPatch {
                        state: Some(TaskStatus::Started),
                        timestamp: Some(Utc::now()),
                        ..RecordPatch::default()
                    },
                )
                .await
            {
                tracing::error!(task_id = %id, error = %e, "Pre-run record write failed");
            }

            let outcome = handler.run(&id, &args, kwargs).await;

            // File this unit into its parent before the terminal write, so
            // anyone observing the terminal state also sees the child
            // aggregated.
            if let Some(parent) = parent_id {
                if let Err(e) = results
                    .store(
                        &parent,
                        RecordPatch {
                            children: vec![id.clone()],
                            ..RecordPatch::default()
                        },
                    )
                    .await
                {
                    tracing::warn!(task_id = %id, parent = %parent, error = %e, "Child aggregation failed");
                }
            }

            match outcome {
                Ok(value) => {
                    let state = TaskStatus::resolve_terminal(kind, TaskStatus::Success);
                    if let Err(e) = results
                        .store(
                            &id,
                            RecordPatch {
                                state: Some(state),
                                result: Some(value),
                                ..RecordPatch::default()
                            },
                        )
                        .await
                    {
                        tracing::error!(task_id = %id, error = %e, "Post-run record write failed");
                    }
                }
                Err(err) => {
                    // The step runner already captured its own failure;
                    // this also covers handlers that fail outside it.
                    if let Err(e) = results
                        .store(
                            &id,
                            RecordPatch {
                                state: Some(TaskStatus::Failure),
                                traceback: Some(traceback_of(&err)),
                                ..RecordPatch::default()
                            },
                        )
                        .await
                    {
                        tracing::error!(task_id = %id, error = %e, "Failure record write failed");
                    }
                }
            }

            running.write().await.remove(&id);
        });
        self.running.write().await.insert(task_id.clone(), handle);

        tracing::debug!(task = %name, task_id = %task_id, queue = %queue, "Unit submitted");
        Ok(task_id)
    }

    async fn revoke(&self, task_id: &str) -> Result<(), EngineError> {
        let handle = self
            .running
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| EngineError::NotRunning {
                task_id: task_id.to_string(),
            })?;
        if handle.is_finished() {
            return Err(EngineError::NotRunning {
                task_id: task_id.to_string(),
            });
        }
        handle.abort();
        if let Err(e) = self
            .results
            .store(
                task_id,
                RecordPatch {
                    state: Some(TaskStatus::Revoked),
                    trace: Some("revoked by request".to_string()),
                    ..RecordPatch::default()
                },
            )
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "Revoke record write failed");
        }
        tracing::info!(task_id = %task_id, "Unit revoked");
        Ok(())
    }
}

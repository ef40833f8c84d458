//! Result store over the backing KV.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, KvError, RemoteError};
use crate::kv::KvStore;
use crate::result::record::{LegacyRecord, RecordPatch, TaskKind, TaskRecord, TraceEntry};
use crate::result::status::TaskStatus;

/// Canonical status store for every executed unit.
///
/// Writes are read-modify-write merges on the backing KV, keyed by
/// `result_prefix + task_id`. Every write also refreshes the
/// legacy-compatible record under `legacy_result_prefix + task_id`.
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
    result_prefix: String,
    legacy_prefix: String,
    result_ttl: Option<Duration>,
    trace_limit: usize,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            result_prefix: config.result_prefix.clone(),
            legacy_prefix: config.legacy_result_prefix.clone(),
            result_ttl: config.result_ttl,
            trace_limit: config.trace_limit,
        }
    }

    fn record_key(&self, task_id: &str) -> String {
        format!("{}{}", self.result_prefix, task_id)
    }

    fn legacy_key(&self, task_id: &str) -> String {
        format!("{}{}", self.legacy_prefix, task_id)
    }

    /// Read the record for `task_id`.
    ///
    /// An id that was never stored yields the default record
    /// (`type: null`, state `PENDING`); missing keys are not an error.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord, KvError> {
        match self.kv.get(&self.record_key(task_id)).await? {
            Some(value) => match serde_json::from_value::<TaskRecord>(value) {
                Ok(record) => Ok(record),
                Err(err) => {
                    tracing::warn!(task_id = %task_id, error = %err, "Unparseable result record");
                    Ok(TaskRecord::missing(task_id))
                }
            },
            None => Ok(TaskRecord::missing(task_id)),
        }
    }

    /// Merge `patch` into the stored record for `task_id`.
    ///
    /// Fields left `None` in the patch are untouched. Once a record is in
    /// `FAILURE` no later patch can move it to another state. Reported
    /// children are classified by their own stored kind: `JOB` children go
    /// into `jobs`, everything else into `childs`.
    pub async fn store(&self, task_id: &str, patch: RecordPatch) -> Result<TaskRecord, KvError> {
        let mut record = self.get(task_id).await?;

        if let Some(name) = patch.name {
            record.name = Some(name);
        }
        if let Some(kind) = patch.kind {
            record.kind = Some(kind);
        }
        if let Some(worker) = patch.worker {
            record.worker = Some(worker);
        }
        if let Some(args) = patch.args {
            record.args = Some(args);
        }
        if let Some(kwargs) = patch.kwargs {
            record.kwargs = Some(kwargs);
        }
        if let Some(state) = patch.state {
            if record.state == TaskStatus::Failure && state != TaskStatus::Failure {
                tracing::debug!(
                    task_id = %task_id,
                    attempted = %state,
                    "Ignoring state change on failed record"
                );
            } else {
                if state != record.state && !record.state.can_transition_to(state) {
                    // Merge-style writes are not rejected, but transitions
                    // outside the state machine are worth a trace.
                    tracing::debug!(
                        task_id = %task_id,
                        from = %record.state,
                        to = %state,
                        "State written outside the normal transition table"
                    );
                }
                record.state = state;
            }
        }
        if let Some(result) = patch.result {
            record.result = Some(result);
        }
        if let Some(traceback) = patch.traceback {
            record.traceback = traceback;
        }
        if let Some(timestamp) = patch.timestamp {
            record.timestamp = Some(timestamp);
        }
        if let Some(duration) = patch.duration {
            record.duration = Some(duration);
        }

        for child_id in patch.children {
            let child = self.get(&child_id).await?;
            if child.kind == Some(TaskKind::Job) {
                record.jobs.insert(child_id);
            } else {
                record.childs.insert(child_id);
            }
        }

        if let Some(message) = patch.trace {
            record.trace.push(TraceEntry::now(message));
            if record.trace.len() > self.trace_limit {
                let drain = record.trace.len() - self.trace_limit;
                record.trace.drain(..drain);
            }
        }

        self.kv
            .set(
                &self.record_key(task_id),
                serde_json::to_value(&record)?,
                self.result_ttl,
            )
            .await?;

        let legacy = LegacyRecord::from_record(&record);
        self.kv
            .set(
                &self.legacy_key(task_id),
                serde_json::to_value(&legacy)?,
                self.result_ttl,
            )
            .await?;

        Ok(record)
    }

    /// Read the legacy-compatible record, if any.
    pub async fn get_legacy(&self, task_id: &str) -> Result<Option<LegacyRecord>, KvError> {
        match self.kv.get(&self.legacy_key(task_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Poll the record for `task_id` until it reaches a terminal state,
    /// sleeping `interval` between polls.
    ///
    /// Success yields the stored result. Failure yields a distinguished
    /// remote error carrying the traceback. Any other terminal observation
    /// (e.g. a revoked unit) yields the unknown-state error.
    pub async fn wait(&self, task_id: &str, interval: Duration) -> Result<Value, Error> {
        loop {
            let record = self.get(task_id).await.map_err(Error::Kv)?;
            match record.state {
                TaskStatus::Success => {
                    return Ok(record.result.unwrap_or(Value::Null));
                }
                TaskStatus::Failure => {
                    return Err(RemoteError::TaskFailed {
                        task_id: task_id.to_string(),
                        traceback: record.traceback,
                    }
                    .into());
                }
                TaskStatus::Pending
                | TaskStatus::Started
                | TaskStatus::Progress
                | TaskStatus::Retry => {}
                other => {
                    return Err(RemoteError::UnknownState {
                        task_id: task_id.to_string(),
                        state: other.to_string(),
                    }
                    .into());
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

//! Result record types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::status::TaskStatus;

/// Kind of an executed unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// A plain leaf task.
    #[default]
    Task,
    /// A task whose body triggers and waits on an independent job.
    #[serde(rename = "JOBTASK")]
    JobTask,
    /// The root unit of a composite job.
    Job,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Task => "TASK",
            Self::JobTask => "JOBTASK",
            Self::Job => "JOB",
        };
        write!(f, "{s}")
    }
}

/// One `[timestamp, message]` entry in a record's trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry(pub DateTime<Utc>, pub String);

impl TraceEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self(Utc::now(), message.into())
    }

    pub fn message(&self) -> &str {
        &self.1
    }
}

/// Canonical record of one executed unit (task or job root).
///
/// Serialized shape is the wire contract consumed by dashboards:
/// `{id, name, type, worker, args, kwargs, state, result, traceback,
/// timestamp, duration, childs, jobs, trace}`. A record that was never
/// stored has `type: null` and state `PENDING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub kwargs: Option<Value>,
    #[serde(default)]
    pub state: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub traceback: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<f64>,
    /// Ids of plain sub-tasks reported by this unit.
    #[serde(default)]
    pub childs: BTreeSet<String>,
    /// Ids of nested independent jobs reported by this unit.
    #[serde(default)]
    pub jobs: BTreeSet<String>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

impl TaskRecord {
    /// The default record returned for ids that were never stored.
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: None,
            worker: None,
            args: None,
            kwargs: None,
            state: TaskStatus::Pending,
            result: None,
            traceback: Vec::new(),
            timestamp: None,
            duration: None,
            childs: BTreeSet::new(),
            jobs: BTreeSet::new(),
            trace: Vec::new(),
        }
    }

    /// Whether a trace entry's message contains `needle`. Test helper for
    /// asserting on step history.
    pub fn trace_contains(&self, needle: &str) -> bool {
        self.trace.iter().any(|entry| entry.message().contains(needle))
    }
}

/// Partial update merged into a [`TaskRecord`] by the store. Fields left
/// `None` are untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub kind: Option<TaskKind>,
    pub worker: Option<String>,
    pub args: Option<Value>,
    pub kwargs: Option<Value>,
    pub state: Option<TaskStatus>,
    pub result: Option<Value>,
    pub traceback: Option<Vec<String>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    /// Child ids reported on completion; the store classifies each one by
    /// its own stored kind.
    pub children: Vec<String>,
    /// Message appended to the trace log with the current timestamp.
    pub trace: Option<String>,
}

impl RecordPatch {
    /// A patch that only appends a trace message.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            trace: Some(text.into()),
            ..Self::default()
        }
    }

    /// A patch that only moves the state.
    pub fn state(state: TaskStatus) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Simplified record written alongside every store, understood by the
/// execution engine's own introspection tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub status: TaskStatus,
    pub traceback: Option<String>,
    pub result: Option<Value>,
    pub task_id: String,
    pub children: Vec<Value>,
}

impl LegacyRecord {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            status: record.state,
            traceback: if record.traceback.is_empty() {
                None
            } else {
                Some(record.traceback.join("\n"))
            },
            result: record.result.clone(),
            task_id: record.id.clone(),
            children: Vec::new(),
        }
    }
}

//! Error types for the orchestration core.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("KV store error: {0}")]
    Kv(#[from] KvError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Remote task error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors. These are fatal, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown step reference: {name}")]
    UnknownStep { name: String },

    #[error("Step name already registered: {name}")]
    DuplicateStep { name: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the backing key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Value at {key} is not a counter")]
    NotACounter { key: String },
}

/// A failure raised inside a step body.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Step {step} failed: {reason}")]
    Failed { step: String, reason: String },

    #[error("Missing step parameter: {name}")]
    MissingParam { name: String },

    #[error("Invalid step parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("KV store error in step: {0}")]
    Kv(#[from] KvError),

    #[error("Remote task error in step: {0}")]
    Remote(#[from] RemoteError),
}

impl StepError {
    /// Shorthand for a business-logic failure inside a named step.
    pub fn failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            step: step.into(),
            reason: reason.into(),
        }
    }
}

/// Errors observed while polling another unit through the result store.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote task {task_id} failed")]
    TaskFailed {
        task_id: String,
        traceback: Vec<String>,
    },

    #[error("Remote task {task_id} finished in unknown state {state}")]
    UnknownState { task_id: String, state: String },
}

/// Persistent schedule store errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule backend error: {0}")]
    Backend(String),

    #[error("Failed to parse schedule entry {name}: {reason}")]
    Parse { name: String, reason: String },

    #[error("Invalid schedule for entry {name}: {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("Schedule entry not found: {name}")]
    NotFound { name: String },
}

/// Errors from the execution engine contract.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No handler registered for task {name}")]
    NotRegistered { name: String },

    #[error("Submit of {name} failed: {reason}")]
    SubmitFailed { name: String, reason: String },

    #[error("Task {task_id} is not running")]
    NotRunning { task_id: String },
}

/// Flatten an error and its source chain into traceback lines for the
/// result record.
pub fn traceback_of(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        lines.push(format!("caused by: {inner}"));
        source = inner.source();
    }
    lines
}

/// Result type alias for the orchestration core.
pub type Result<T> = std::result::Result<T, Error>;

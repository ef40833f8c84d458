//! Execution engine contract.
//!
//! The distributed engine that dispatches units to worker processes is an
//! external collaborator; the core only consumes this contract: submit a
//! unit of work, observe completion through the result store, revoke by
//! id. [`LocalEngine`] is the in-process implementation used by the demo
//! binary and the integration tests.

mod local;

pub use local::{LocalEngine, TaskHandler};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::result::TaskKind;
use crate::runner::Params;

/// Options accompanying a unit submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Routing queue; `None` routes to the engine's default.
    pub queue: Option<String>,
    /// Pre-assigned unit id; `None` lets the engine assign one.
    pub task_id: Option<String>,
    /// Override of the unit's kind; `None` uses the handler's own kind.
    pub kind: Option<TaskKind>,
    /// Unit whose record aggregates this unit on completion.
    pub parent_id: Option<String>,
}

/// Contract consumed from the external execution engine.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Submit a unit of work for asynchronous execution. Returns the
    /// unit's id.
    async fn submit(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Params,
        options: SubmitOptions,
    ) -> Result<String, EngineError>;

    /// Revoke a running unit by id.
    async fn revoke(&self, task_id: &str) -> Result<(), EngineError>;
}

//! Step runner — per-invocation execution context and the ordered-step
//! execution loop.

mod context;
mod registry;
mod runner;
mod step;

pub use context::{ExecutionContext, Identity};
pub use registry::StepRegistry;
pub use runner::{RunReport, StepRunner, StoreSession, TaskSpec};
pub use step::{
    from_fn, instrument, Params, Step, StepFn, StepRecord, StepRef, StepResult, StepStatus,
};

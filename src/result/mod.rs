//! Canonical result store for tasks and jobs.

mod record;
mod status;
mod store;

pub use record::{LegacyRecord, RecordPatch, TaskKind, TaskRecord, TraceEntry};
pub use status::TaskStatus;
pub use store::ResultStore;

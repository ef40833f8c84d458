//! Conveyor — job/task orchestration and scheduling core.
//!
//! Tracks every executed unit in a canonical result store, runs ordered
//! steps inside a single invocation, composes units into jobs with
//! start/end brackets, passes data between workers through a KV-backed
//! shared area, and keeps a durable table of periodic schedule entries
//! consulted by the beat loop. The distributed execution engine and the
//! KV store are external collaborators consumed through traits.

pub mod canvas;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv;
pub mod result;
pub mod runner;
pub mod schedule;
pub mod shared;

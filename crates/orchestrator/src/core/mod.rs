//! Core abstractions of the phase execution model.
//!
//! - [`PhaseExecutor`] - lifecycle contract every phase kind implements
//! - [`ExecutorRegistry`] - builds executors by phase kind
//! - [`FsmEngine`] - schedules, persists and rolls back plan phases

mod execution;
mod phase;
mod registry;

pub use execution::{
    ExecutionMode, FailurePolicy, FsmConfig, FsmEngine, RunSummary, Selection,
};
pub use phase::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
pub use registry::{ExecutorFactory, ExecutorRegistry};

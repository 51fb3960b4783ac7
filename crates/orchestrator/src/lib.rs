//! Phase execution for cluster install and upgrade operations.
//!
//! The [`FsmEngine`] drives a persisted [`installer_core::Plan`], building an
//! executor for every phase through the [`ExecutorRegistry`] and persisting
//! each state transition through the [`services::Operator`].

pub mod core;
pub mod error;
pub mod log_pipe;
pub mod phases;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod services;

pub use crate::core::{
    check_master_server, ExecContext, ExecutionMode, ExecutorFactory, ExecutorParams,
    ExecutorRegistry, FailurePolicy, FsmConfig, FsmEngine, PhaseExecutor, RunSummary, Selection,
};
pub use error::{OrchestratorError, Result, RollbackFailure};
pub use log_pipe::LogPipe;
pub use planner::{InstallPlanner, PlanRequest};
pub use progress::ProgressReporter;
pub use retry::{retry, Backoff, RetryPolicy};
pub use services::{ExecutorSettings, Services};

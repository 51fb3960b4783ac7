//! Phase execution engine.
//!
//! [`FsmEngine`] walks a persisted [`Plan`]: it dispatches the frontier of
//! phases whose dependencies are completed, runs each through
//! `pre_check -> execute -> post_check` on a bounded set of tasks, and
//! persists every phase transition before any dependent phase is scheduled.
//! The scheduling loop itself is sequential, so plan state is only ever
//! written from one place.

use futures::FutureExt;
use installer_core::{
    OperationKey, Phase, PhaseState, PhaseStateMachine, Plan, PlanState,
};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use events::EventBus;

use crate::error::{OrchestratorError, Result, RollbackFailure};
use crate::progress::ProgressReporter;
use crate::retry::{retry, RetryPolicy};
use crate::services::Services;

use super::phase::{ExecContext, ExecutorParams, PhaseExecutor};
use super::registry::ExecutorRegistry;

const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Drain the plan until it completes or a phase fails
    #[default]
    Automatic,
    /// Execute one eligible phase per invocation
    Manual,
}

/// What happens to independent branches after a phase fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop dispatching, let running phases finish
    #[default]
    Stop,
    /// Keep dispatching phases that do not depend on the failed one
    Continue,
}

impl FailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub mode: ExecutionMode,
    /// Upper bound on concurrently running phases
    pub max_parallel: usize,
    pub failure_policy: FailurePolicy,
    /// Policy `execute` runs under
    pub execute_retry: RetryPolicy,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Automatic,
            max_parallel: 4,
            failure_policy: FailurePolicy::Stop,
            execute_retry: RetryPolicy::once(),
        }
    }
}

/// Which phases a run may dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// The first eligible phase only
    Next,
    Only(String),
}

/// Outcome of one engine invocation.
#[derive(Debug)]
pub struct RunSummary {
    pub key: OperationKey,
    pub state: PlanState,
    /// Phases completed by this invocation, in completion order
    pub executed: Vec<String>,
    pub failures: Vec<OrchestratorError>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The plan state, or the first phase failure.
    pub fn into_result(self) -> Result<PlanState> {
        match self.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

/// Working copy of a plan whose transitions are persisted as they happen.
struct PlanRun<'a> {
    engine: &'a FsmEngine,
    plan: Plan,
    state: PlanState,
    reporter: ProgressReporter,
}

impl PlanRun<'_> {
    async fn set_state(&mut self, id: &str, to: PhaseState, error: Option<String>) -> Result<Phase> {
        let phase = self.plan.transition(id, to, error)?.clone();
        let operator = &self.engine.services.operator;
        operator.set_phase_state(self.plan.key(), &phase).await?;

        let state = self.plan.state();
        if state != self.state {
            operator.set_plan_state(self.plan.key(), state).await?;
            self.reporter.plan_state_changed(self.state, state);
            self.state = state;
        }
        Ok(phase)
    }

    /// Fail phases a previous process left running.
    async fn recover_interrupted(&mut self) -> Result<()> {
        let interrupted: Vec<Phase> = self
            .plan
            .phases()
            .iter()
            .filter(|phase| phase.state == PhaseState::InProgress)
            .cloned()
            .collect();
        for phase in interrupted {
            warn!(operation = %self.plan.key(), phase = %phase.id, "Phase was interrupted");
            self.set_state(&phase.id, PhaseState::Failed, Some(INTERRUPTED.to_string()))
                .await?;
            self.reporter
                .phase_failed(&phase.id, server_name(&phase), INTERRUPTED);
        }
        Ok(())
    }

    fn params(&self, phase: Phase) -> ExecutorParams {
        ExecutorParams {
            key: self.plan.key().clone(),
            operation: self.plan.kind(),
            progress: self.reporter.for_phase(phase.id.clone()),
            phase,
            servers: self.plan.servers().to_vec(),
        }
    }
}

fn server_name(phase: &Phase) -> Option<String> {
    phase.server().map(ToString::to_string)
}

pub struct FsmEngine {
    services: Services,
    registry: Arc<ExecutorRegistry>,
    bus: EventBus,
    config: FsmConfig,
    cancel: CancellationToken,
}

impl FsmEngine {
    pub fn new(
        services: Services,
        registry: Arc<ExecutorRegistry>,
        bus: EventBus,
        config: FsmConfig,
    ) -> Self {
        Self {
            services,
            registry,
            bus,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` as the engine-wide cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &FsmConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    fn reporter(&self, key: &OperationKey) -> ProgressReporter {
        ProgressReporter::new(self.bus.clone(), key.operation_id)
    }

    async fn load(&self, key: &OperationKey) -> Result<PlanRun<'_>> {
        let plan = self.services.operator.get_plan(key).await?;
        let mut run = PlanRun {
            engine: self,
            state: plan.state(),
            reporter: self.reporter(key),
            plan,
        };
        run.recover_interrupted().await?;
        Ok(run)
    }

    /// Persist a new plan.
    pub async fn create(&self, plan: Plan) -> Result<Plan> {
        self.services.operator.create_plan(&plan).await?;
        info!(operation = %plan.key(), kind = plan.kind().as_str(), phases = plan.phases().len(), "Plan created");
        self.reporter(plan.key()).plan_created(plan.phases().len());
        Ok(plan)
    }

    pub async fn plan(&self, key: &OperationKey) -> Result<Plan> {
        self.services.operator.get_plan(key).await
    }

    /// Run the plan according to the configured mode.
    pub async fn run(&self, key: &OperationKey) -> Result<RunSummary> {
        match self.config.mode {
            ExecutionMode::Automatic => self.drive(key, Selection::All).await,
            ExecutionMode::Manual => self.drive(key, Selection::Next).await,
        }
    }

    /// Execute the next eligible phase.
    pub async fn step(&self, key: &OperationKey) -> Result<RunSummary> {
        self.drive(key, Selection::Next).await
    }

    /// Execute a single named phase.
    ///
    /// Refuses while a dependency of the phase is not completed, and once the
    /// whole operation has been rolled back.
    pub async fn execute_phase(&self, key: &OperationKey, id: &str) -> Result<RunSummary> {
        let plan = self.services.operator.get_plan(key).await?;
        let phase = plan
            .phase(id)
            .ok_or_else(|| installer_core::CoreError::PhaseNotFound(id.to_string()))?;
        let state = plan.state();
        if state == PlanState::RolledBack {
            return Err(OrchestratorError::Precondition(format!(
                "operation {key} is {state}, start a new operation instead"
            )));
        }
        if phase.state == PhaseState::Completed {
            return Err(OrchestratorError::Precondition(format!(
                "phase {id} is already completed"
            )));
        }
        let pending = plan.pending_dependencies(id)?;
        if !pending.is_empty() {
            return Err(installer_core::CoreError::DependenciesIncomplete {
                phase: id.to_string(),
                pending,
            }
            .into());
        }
        self.drive(key, Selection::Only(id.to_string())).await
    }

    /// Dispatch eligible phases until nothing more can run.
    ///
    /// Phase failures are collected in the summary. An error is returned
    /// only when the plan cannot be loaded or persisted.
    pub async fn drive(&self, key: &OperationKey, selection: Selection) -> Result<RunSummary> {
        let mut run = self.load(key).await?;
        let max_parallel = self.config.max_parallel.max(1);

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        // phase id -> hostname of its target server
        let mut running: HashMap<String, Option<String>> = HashMap::new();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut executed = Vec::new();
        let mut failures = Vec::new();
        let mut halted = false;

        loop {
            if !halted && !self.cancel.is_cancelled() {
                let candidates: Vec<Phase> = run
                    .plan
                    .frontier()
                    .into_iter()
                    .filter(|phase| !attempted.contains(&phase.id))
                    .filter(|phase| match &selection {
                        Selection::Only(id) => phase.id == *id,
                        _ => true,
                    })
                    .cloned()
                    .collect();

                for phase in candidates {
                    if running.len() >= max_parallel {
                        break;
                    }
                    if selection == Selection::Next && !attempted.is_empty() {
                        break;
                    }
                    let host = phase.server().map(|server| server.hostname.clone());
                    if host.is_some() && running.values().any(|busy| *busy == host) {
                        continue;
                    }

                    attempted.insert(phase.id.clone());
                    let started = run.set_state(&phase.id, PhaseState::InProgress, None).await?;
                    run.reporter.phase_started(&started.id, server_name(&started));
                    running.insert(started.id.clone(), host);

                    let params = run.params(started);
                    tasks.spawn(run_phase(
                        Arc::clone(&self.registry),
                        self.services.clone(),
                        params,
                        self.cancel.clone(),
                        self.config.execute_retry,
                    ));
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(operation = %key, error = %err, "Phase task was lost");
                    continue;
                }
            };
            running.remove(&id);

            match result {
                Ok(()) => {
                    run.set_state(&id, PhaseState::Completed, None).await?;
                    run.reporter.phase_completed(&id);
                    executed.push(id);
                }
                Err(err) => {
                    let message = err.to_string();
                    let server = run.plan.phase(&id).and_then(server_name);
                    run.set_state(&id, PhaseState::Failed, Some(message.clone()))
                        .await?;
                    run.reporter.phase_failed(&id, server, &message);
                    failures.push(err);
                    if self.config.failure_policy == FailurePolicy::Stop {
                        halted = true;
                    }
                }
            }
        }

        // only reachable when a task was lost
        for id in running.into_keys() {
            run.set_state(&id, PhaseState::Failed, Some(INTERRUPTED.to_string()))
                .await?;
            failures.push(OrchestratorError::phase_failed(
                id,
                None,
                OrchestratorError::ExecutionFailed(INTERRUPTED.to_string()),
            ));
        }

        let state = run.plan.state();
        debug!(operation = %key, %state, executed = executed.len(), failed = failures.len(), "Run finished");
        Ok(RunSummary {
            key: key.clone(),
            state,
            executed,
            failures,
        })
    }

    /// Roll back every completed or failed phase in reverse dependency
    /// order.
    ///
    /// Rollback is best effort: a failing phase does not stop the others,
    /// the failures are returned together.
    pub async fn rollback(&self, key: &OperationKey) -> Result<PlanState> {
        let mut run = self.load(key).await?;
        let order: Vec<Phase> = run
            .plan
            .topological_order()
            .into_iter()
            .rev()
            .filter(|phase| PhaseStateMachine::can_roll_back(&phase.state))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for phase in order {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled(format!("rollback of {key}")));
            }
            let id = phase.id.clone();
            match self.rollback_one(run.params(phase)).await {
                Ok(()) => {
                    run.set_state(&id, PhaseState::RolledBack, None).await?;
                    run.reporter.phase_rolled_back(&id);
                }
                Err(err) => {
                    warn!(operation = %key, phase = %id, error = %err, "Rollback failed");
                    failures.push(RollbackFailure {
                        phase: id,
                        error: err.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(run.plan.state())
        } else {
            Err(OrchestratorError::RollbackFailed { failures })
        }
    }

    /// Roll back a single phase.
    ///
    /// Refuses while a phase depending on it is still completed.
    pub async fn rollback_phase(&self, key: &OperationKey, id: &str) -> Result<()> {
        let mut run = self.load(key).await?;
        let phase = run
            .plan
            .phase(id)
            .cloned()
            .ok_or_else(|| installer_core::CoreError::PhaseNotFound(id.to_string()))?;
        if !PhaseStateMachine::can_roll_back(&phase.state) {
            return Err(OrchestratorError::Precondition(format!(
                "phase {id} is {} and cannot be rolled back",
                phase.state
            )));
        }
        let completed: Vec<String> = run
            .plan
            .dependents_of(id)?
            .into_iter()
            .filter(|dependent| {
                run.plan
                    .phase(dependent)
                    .is_some_and(|p| p.state == PhaseState::Completed)
            })
            .collect();
        if !completed.is_empty() {
            return Err(OrchestratorError::Precondition(format!(
                "roll back {} before {id}",
                completed.join(", ")
            )));
        }

        if let Err(err) = self.rollback_one(run.params(phase)).await {
            return Err(OrchestratorError::RollbackFailed {
                failures: vec![RollbackFailure {
                    phase: id.to_string(),
                    error: err.to_string(),
                }],
            });
        }
        run.set_state(id, PhaseState::RolledBack, None).await?;
        run.reporter.phase_rolled_back(id);
        Ok(())
    }

    async fn rollback_one(&self, params: ExecutorParams) -> Result<()> {
        let id = params.phase.id.clone();
        let failed = params.phase.state == PhaseState::Failed;
        let executor = match self.registry.build(params, &self.services).await {
            Ok(executor) => executor,
            // a failed phase whose parameters are rejected never got past
            // construction, so there is nothing to undo
            Err(OrchestratorError::BadParameter(reason)) if failed => {
                debug!(phase = %id, %reason, "Phase never ran, skipping rollback");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        executor
            .rollback(&ExecContext::new(self.cancel.clone()))
            .await
    }

    /// Archive a plan that reached a terminal state.
    pub async fn archive(&self, key: &OperationKey) -> Result<()> {
        let plan = self.services.operator.get_plan(key).await?;
        let state = plan.state();
        if !state.is_terminal() {
            return Err(OrchestratorError::Precondition(format!(
                "operation {key} is {state}, only completed or rolled back operations can be archived"
            )));
        }
        self.services.operator.archive_plan(key).await?;
        info!(operation = %key, "Operation archived");
        Ok(())
    }
}

/// Full lifecycle of one phase on its own task.
async fn run_phase(
    registry: Arc<ExecutorRegistry>,
    services: Services,
    params: ExecutorParams,
    cancel: CancellationToken,
    execute_retry: RetryPolicy,
) -> (String, Result<()>) {
    let id = params.phase.id.clone();
    let server = server_name(&params.phase);

    let work = AssertUnwindSafe(lifecycle(registry, services, params, cancel.clone(), execute_retry))
        .catch_unwind();
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(OrchestratorError::phase_failed(
            id.clone(),
            server,
            OrchestratorError::Cancelled("operation cancelled".to_string()),
        )),
        outcome = work => match outcome {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::phase_failed(
                id.clone(),
                server,
                OrchestratorError::ExecutionFailed("executor panicked".to_string()),
            )),
        },
    };
    (id, result)
}

async fn lifecycle(
    registry: Arc<ExecutorRegistry>,
    services: Services,
    params: ExecutorParams,
    cancel: CancellationToken,
    execute_retry: RetryPolicy,
) -> Result<()> {
    let id = params.phase.id.clone();
    let server = server_name(&params.phase);
    let pre_check_failed = |err: OrchestratorError| {
        OrchestratorError::pre_check_failed(id.clone(), server.clone(), err)
    };
    let phase_failed =
        |err: OrchestratorError| OrchestratorError::phase_failed(id.clone(), server.clone(), err);

    let executor: Box<dyn PhaseExecutor> = registry
        .build(params, &services)
        .await
        .map_err(pre_check_failed)?;
    let ctx = ExecContext::new(cancel.clone());

    executor.pre_check(&ctx).await.map_err(pre_check_failed)?;
    let executed = if execute_retry.max_attempts > 1 {
        let what = format!("executing phase {id}");
        retry(&execute_retry, &cancel, &what, || executor.execute(&ctx)).await
    } else {
        executor.execute(&ctx).await
    };
    executed.map_err(phase_failed)?;
    executor.post_check(&ctx).await.map_err(phase_failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(FailurePolicy::parse("stop"), Some(FailurePolicy::Stop));
        assert_eq!(FailurePolicy::parse("continue"), Some(FailurePolicy::Continue));
        assert_eq!(FailurePolicy::parse("abort"), None);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Stop);
    }

    #[test]
    fn test_summary_into_result() {
        let key = OperationKey::new("prod");
        let ok = RunSummary {
            key: key.clone(),
            state: PlanState::Completed,
            executed: vec!["/wait".into()],
            failures: vec![],
        };
        assert_eq!(ok.into_result().unwrap(), PlanState::Completed);

        let failed = RunSummary {
            key,
            state: PlanState::Failed,
            executed: vec![],
            failures: vec![OrchestratorError::Precondition("no master".into())],
        };
        assert!(!failed.is_success());
        assert!(failed.into_result().is_err());
    }
}

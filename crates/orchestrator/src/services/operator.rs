//! Operation storage: plans, phase states and operation logs.

use async_trait::async_trait;
use db::{DbError, OperationLogRepository, PlanRepository};
use installer_core::{OperationKey, Phase, Plan, PlanState};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncRead, BufReader};
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::log_pipe::read_line_lossy;

pub type LogReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Operator: Send + Sync {
    async fn create_plan(&self, plan: &Plan) -> Result<()>;

    /// Fails with `NotFound` for unknown operations.
    async fn get_plan(&self, key: &OperationKey) -> Result<Plan>;

    /// Most recent plan of `cluster` that has not been archived.
    async fn active_plan(&self, cluster: &str) -> Result<Option<Plan>>;

    async fn set_phase_state(&self, key: &OperationKey, phase: &Phase) -> Result<()>;

    async fn set_plan_state(&self, key: &OperationKey, state: PlanState) -> Result<()>;

    async fn archive_plan(&self, key: &OperationKey) -> Result<()>;

    /// Append every line read from `reader` to the operation log until EOF.
    async fn stream_operation_logs(&self, key: &OperationKey, reader: LogReader) -> Result<()>;

    async fn operation_logs(&self, key: &OperationKey) -> Result<Vec<String>>;
}

/// Operator backed by the SQLite repositories.
#[derive(Clone)]
pub struct SqliteOperator {
    plans: PlanRepository,
    logs: OperationLogRepository,
}

impl SqliteOperator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            plans: PlanRepository::new(pool.clone()),
            logs: OperationLogRepository::new(pool),
        }
    }
}

fn not_found(err: DbError) -> OrchestratorError {
    match err {
        DbError::PlanNotFound(key) => OrchestratorError::NotFound(format!("operation {key}")),
        DbError::PhaseNotFound { operation, phase } => {
            OrchestratorError::NotFound(format!("phase {phase} of operation {operation}"))
        }
        other => other.into(),
    }
}

#[async_trait]
impl Operator for SqliteOperator {
    async fn create_plan(&self, plan: &Plan) -> Result<()> {
        self.plans.create(plan).await?;
        Ok(())
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<Plan> {
        self.plans
            .find_by_key(key)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {key}")))
    }

    async fn active_plan(&self, cluster: &str) -> Result<Option<Plan>> {
        Ok(self.plans.find_active(cluster).await?)
    }

    async fn set_phase_state(&self, key: &OperationKey, phase: &Phase) -> Result<()> {
        self.plans
            .update_phase_state(key, phase)
            .await
            .map_err(not_found)
    }

    async fn set_plan_state(&self, key: &OperationKey, state: PlanState) -> Result<()> {
        self.plans
            .update_plan_state(key, state)
            .await
            .map_err(not_found)
    }

    async fn archive_plan(&self, key: &OperationKey) -> Result<()> {
        if !self.plans.archive(key).await? {
            return Err(OrchestratorError::NotFound(format!("operation {key}")));
        }
        Ok(())
    }

    async fn stream_operation_logs(&self, key: &OperationKey, reader: LogReader) -> Result<()> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut count = 0usize;
        while let Some(line) = read_line_lossy(&mut reader, &mut buf).await? {
            self.logs.append(key.operation_id, &line).await?;
            count += 1;
        }
        debug!(operation = %key, lines = count, "Operation log stream closed");
        Ok(())
    }

    async fn operation_logs(&self, key: &OperationKey) -> Result<Vec<String>> {
        Ok(self
            .logs
            .find_by_operation(key.operation_id)
            .await?
            .into_iter()
            .map(|log| log.line)
            .collect())
    }
}

#[derive(Debug, Clone)]
struct StoredPlan {
    plan: Plan,
    archived: bool,
    state: PlanState,
}

/// Operator keeping everything in memory. Used by tests and dry runs.
///
/// Every phase write is also appended to a history that tests can inspect.
#[derive(Debug, Default)]
pub struct InMemoryOperator {
    plans: Mutex<HashMap<OperationKey, StoredPlan>>,
    logs: Mutex<HashMap<OperationKey, Vec<String>>>,
    history: Mutex<Vec<Phase>>,
}

impl InMemoryOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every phase record written through [`Operator::set_phase_state`], in order.
    pub fn history(&self) -> Vec<Phase> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// Last plan state written for the operation.
    pub fn stored_state(&self, key: &OperationKey) -> Option<PlanState> {
        self.plans
            .lock()
            .ok()
            .and_then(|plans| plans.get(key).map(|stored| stored.state))
    }

    pub fn is_archived(&self, key: &OperationKey) -> bool {
        self.plans
            .lock()
            .ok()
            .and_then(|plans| plans.get(key).map(|stored| stored.archived))
            .unwrap_or(false)
    }
}

fn poisoned<T>(_: T) -> OrchestratorError {
    OrchestratorError::ExecutionFailed("operator state lock poisoned".to_string())
}

#[async_trait]
impl Operator for InMemoryOperator {
    async fn create_plan(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.lock().map_err(poisoned)?;
        if plans.contains_key(plan.key()) {
            return Err(OrchestratorError::Conflict(format!(
                "operation {} already exists",
                plan.key()
            )));
        }
        plans.insert(
            plan.key().clone(),
            StoredPlan {
                plan: plan.clone(),
                archived: false,
                state: plan.state(),
            },
        );
        Ok(())
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<Plan> {
        let plans = self.plans.lock().map_err(poisoned)?;
        plans
            .get(key)
            .map(|stored| stored.plan.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {key}")))
    }

    async fn active_plan(&self, cluster: &str) -> Result<Option<Plan>> {
        let plans = self.plans.lock().map_err(poisoned)?;
        Ok(plans
            .values()
            .filter(|stored| !stored.archived && stored.plan.key().cluster == cluster)
            .max_by_key(|stored| stored.plan.created_at())
            .map(|stored| stored.plan.clone()))
    }

    async fn set_phase_state(&self, key: &OperationKey, phase: &Phase) -> Result<()> {
        let mut plans = self.plans.lock().map_err(poisoned)?;
        let stored = plans
            .get_mut(key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {key}")))?;

        let mut phases = stored.plan.phases().to_vec();
        let slot = phases
            .iter_mut()
            .find(|existing| existing.id == phase.id)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("phase {} of operation {key}", phase.id))
            })?;
        slot.state = phase.state;
        slot.error = phase.error.clone();
        slot.updated_at = phase.updated_at;

        stored.plan = Plan::restore(
            key.clone(),
            stored.plan.kind(),
            stored.plan.servers().to_vec(),
            phases,
            stored.plan.created_at(),
        )?;
        self.history.lock().map_err(poisoned)?.push(phase.clone());
        Ok(())
    }

    async fn set_plan_state(&self, key: &OperationKey, state: PlanState) -> Result<()> {
        let mut plans = self.plans.lock().map_err(poisoned)?;
        let stored = plans
            .get_mut(key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {key}")))?;
        stored.state = state;
        Ok(())
    }

    async fn archive_plan(&self, key: &OperationKey) -> Result<()> {
        let mut plans = self.plans.lock().map_err(poisoned)?;
        let stored = plans
            .get_mut(key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {key}")))?;
        stored.archived = true;
        Ok(())
    }

    async fn stream_operation_logs(&self, key: &OperationKey, reader: LogReader) -> Result<()> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        while let Some(line) = read_line_lossy(&mut reader, &mut buf).await? {
            self.logs
                .lock()
                .map_err(poisoned)?
                .entry(key.clone())
                .or_default()
                .push(line);
        }
        Ok(())
    }

    async fn operation_logs(&self, key: &OperationKey) -> Result<Vec<String>> {
        let logs = self.logs.lock().map_err(poisoned)?;
        Ok(logs.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_core::{OperationKind, PhaseKind, PhaseState};

    fn sample_plan() -> Plan {
        Plan::new(
            OperationKey::new("prod"),
            OperationKind::Install,
            vec![],
            vec![
                Phase::new("/wait", "Wait for the planet", PhaseKind::Wait),
                Phase::new("/app", "Run app hooks", PhaseKind::App).requires(["/wait"]),
            ],
        )
        .unwrap()
    }

    async fn exercise(operator: &dyn Operator) {
        let mut plan = sample_plan();
        operator.create_plan(&plan).await.unwrap();

        let phase = plan
            .transition("/wait", PhaseState::InProgress, None)
            .unwrap()
            .clone();
        operator.set_phase_state(plan.key(), &phase).await.unwrap();
        operator
            .set_plan_state(plan.key(), plan.state())
            .await
            .unwrap();

        let stored = operator.get_plan(plan.key()).await.unwrap();
        assert_eq!(stored.phase("/wait").unwrap().state, PhaseState::InProgress);
        assert_eq!(
            operator.active_plan("prod").await.unwrap().unwrap().key(),
            plan.key()
        );

        let reader: LogReader = Box::new(&b"install hook started\njob finished\n"[..]);
        operator
            .stream_operation_logs(plan.key(), reader)
            .await
            .unwrap();
        assert_eq!(
            operator.operation_logs(plan.key()).await.unwrap(),
            vec!["install hook started", "job finished"]
        );

        operator.archive_plan(plan.key()).await.unwrap();
        assert!(operator.active_plan("prod").await.unwrap().is_none());

        let missing = OperationKey::new("prod");
        assert!(operator.get_plan(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_in_memory_operator() {
        let operator = InMemoryOperator::new();
        exercise(&operator).await;
        assert_eq!(operator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_operator() {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        exercise(&SqliteOperator::new(pool)).await;
    }

    #[tokio::test]
    async fn test_unknown_phase_is_not_found() {
        let operator = InMemoryOperator::new();
        let plan = sample_plan();
        operator.create_plan(&plan).await.unwrap();

        let stray = Phase::new("/stray", "stray", PhaseKind::Wait);
        let err = operator
            .set_phase_state(plan.key(), &stray)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

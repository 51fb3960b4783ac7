use crate::error::DbError;
use crate::models::{datetime_to_timestamp, PhaseRow, PlanRow};
use chrono::Utc;
use installer_core::{OperationKey, Phase, Plan, PlanState};
use sqlx::SqlitePool;
use tracing::debug;

const PLAN_COLUMNS: &str =
    "operation_id, cluster, kind, state, servers, archived, created_at, updated_at";
const PHASE_COLUMNS: &str =
    "operation_id, phase_id, position, description, kind, data, requires, state, error, updated_at";

#[derive(Clone)]
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a new plan with all of its phases in one transaction.
    pub async fn create(&self, plan: &Plan) -> Result<(), DbError> {
        let row = PlanRow::from_domain(plan)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO plans (operation_id, cluster, kind, state, servers, archived, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&row.operation_id)
        .bind(&row.cluster)
        .bind(&row.kind)
        .bind(&row.state)
        .bind(&row.servers)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await?;

        for (position, phase) in plan.phases().iter().enumerate() {
            let phase_row = PhaseRow::from_domain(plan.key(), position, phase)?;
            sqlx::query(
                r#"
                INSERT INTO plan_phases (operation_id, phase_id, position, description, kind, data, requires, state, error, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&phase_row.operation_id)
            .bind(&phase_row.phase_id)
            .bind(phase_row.position)
            .bind(&phase_row.description)
            .bind(&phase_row.kind)
            .bind(&phase_row.data)
            .bind(&phase_row.requires)
            .bind(&phase_row.state)
            .bind(&phase_row.error)
            .bind(phase_row.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(operation = %plan.key(), phases = plan.phases().len(), "Plan persisted");
        Ok(())
    }

    async fn load(&self, row: PlanRow) -> Result<Plan, DbError> {
        let phases: Vec<PhaseRow> = sqlx::query_as(&format!(
            "SELECT {PHASE_COLUMNS} FROM plan_phases WHERE operation_id = ? ORDER BY position ASC"
        ))
        .bind(&row.operation_id)
        .fetch_all(&self.pool)
        .await?;

        row.into_domain(phases)
    }

    pub async fn find_by_key(&self, key: &OperationKey) -> Result<Option<Plan>, DbError> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE operation_id = ? AND cluster = ?"
        ))
        .bind(key.operation_id.to_string())
        .bind(&key.cluster)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    /// All plans that have not been archived, newest first.
    pub async fn find_all(&self) -> Result<Vec<Plan>, DbError> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE archived = 0 ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut plans = Vec::with_capacity(rows.len());
        for row in rows {
            plans.push(self.load(row).await?);
        }
        Ok(plans)
    }

    /// The most recent plan of a cluster that has not been archived.
    pub async fn find_active(&self, cluster: &str) -> Result<Option<Plan>, DbError> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE cluster = ? AND archived = 0 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(cluster)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn update_phase_state(&self, key: &OperationKey, phase: &Phase) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE plan_phases
            SET state = ?, error = ?, updated_at = ?
            WHERE operation_id = ? AND phase_id = ?
            "#,
        )
        .bind(phase.state.as_str())
        .bind(&phase.error)
        .bind(datetime_to_timestamp(phase.updated_at))
        .bind(key.operation_id.to_string())
        .bind(&phase.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::PhaseNotFound {
                operation: key.to_string(),
                phase: phase.id.clone(),
            });
        }
        Ok(())
    }

    pub async fn update_plan_state(&self, key: &OperationKey, state: PlanState) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET state = ?, updated_at = ?
            WHERE operation_id = ? AND cluster = ?
            "#,
        )
        .bind(state.as_str())
        .bind(datetime_to_timestamp(Utc::now()))
        .bind(key.operation_id.to_string())
        .bind(&key.cluster)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::PlanNotFound(key.to_string()));
        }
        Ok(())
    }

    /// Mark a plan archived. Archived plans stay readable by key.
    pub async fn archive(&self, key: &OperationKey) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE plans SET archived = 1, updated_at = ? WHERE operation_id = ? AND cluster = ?",
        )
        .bind(datetime_to_timestamp(Utc::now()))
        .bind(key.operation_id.to_string())
        .bind(&key.cluster)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, key: &OperationKey) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM plans WHERE operation_id = ? AND cluster = ?")
            .bind(key.operation_id.to_string())
            .bind(&key.cluster)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

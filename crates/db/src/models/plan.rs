use chrono::{DateTime, TimeZone, Utc};
use installer_core::{
    OperationKey, OperationKind, Phase, PhaseData, PhaseKind, PhaseState, Plan, Server,
};
use uuid::Uuid;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRow {
    pub operation_id: String,
    pub cluster: String,
    pub kind: String,
    pub state: String,
    pub servers: String,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhaseRow {
    pub operation_id: String,
    pub phase_id: String,
    pub position: i64,
    pub description: String,
    pub kind: String,
    pub data: String,
    pub requires: String,
    pub state: String,
    pub error: Option<String>,
    pub updated_at: i64,
}

impl PlanRow {
    pub fn from_domain(plan: &Plan) -> Result<Self, DbError> {
        let now = datetime_to_timestamp(Utc::now());
        Ok(Self {
            operation_id: plan.key().operation_id.to_string(),
            cluster: plan.key().cluster.clone(),
            kind: plan.kind().as_str().to_string(),
            state: plan.state().as_str().to_string(),
            servers: serde_json::to_string(plan.servers())?,
            archived: false,
            created_at: datetime_to_timestamp(plan.created_at()),
            updated_at: now,
        })
    }

    pub fn key(&self) -> Result<OperationKey, DbError> {
        let operation_id = Uuid::parse_str(&self.operation_id)
            .map_err(|e| DbError::Corrupt(format!("operation id {}: {e}", self.operation_id)))?;
        Ok(OperationKey::new(self.cluster.clone()).with_id(operation_id))
    }

    /// Rebuild the plan; phase rows must be ordered by position.
    pub fn into_domain(self, phases: Vec<PhaseRow>) -> Result<Plan, DbError> {
        let key = self.key()?;
        let kind = OperationKind::parse(&self.kind)
            .ok_or_else(|| DbError::Corrupt(format!("operation kind {}", self.kind)))?;
        let servers: Vec<Server> = serde_json::from_str(&self.servers)?;
        let phases = phases
            .into_iter()
            .map(PhaseRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Plan::restore(
            key,
            kind,
            servers,
            phases,
            timestamp_to_datetime(self.created_at),
        )?)
    }
}

impl PhaseRow {
    pub fn from_domain(key: &OperationKey, position: usize, phase: &Phase) -> Result<Self, DbError> {
        Ok(Self {
            operation_id: key.operation_id.to_string(),
            phase_id: phase.id.clone(),
            position: position as i64,
            description: phase.description.clone(),
            kind: phase.kind.as_str().to_string(),
            data: serde_json::to_string(&phase.data)?,
            requires: serde_json::to_string(&phase.requires)?,
            state: phase.state.as_str().to_string(),
            error: phase.error.clone(),
            updated_at: datetime_to_timestamp(phase.updated_at),
        })
    }

    pub fn into_domain(self) -> Result<Phase, DbError> {
        let kind = PhaseKind::parse(&self.kind)
            .ok_or_else(|| DbError::Corrupt(format!("phase kind {}", self.kind)))?;
        let state = PhaseState::parse(&self.state)
            .ok_or_else(|| DbError::Corrupt(format!("phase state {}", self.state)))?;
        let data: PhaseData = serde_json::from_str(&self.data)?;
        let requires: Vec<String> = serde_json::from_str(&self.requires)?;

        let mut phase = Phase::new(self.phase_id, self.description, kind)
            .with_data(data)
            .requires(requires);
        phase.state = state;
        phase.error = self.error;
        phase.updated_at = timestamp_to_datetime(self.updated_at);
        Ok(phase)
    }
}

pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts).single().unwrap_or_default()
}

pub(crate) fn datetime_to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

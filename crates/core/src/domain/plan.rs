use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use super::phase::{Phase, PhaseState};
use super::server::{OperationKey, OperationKind, Server};
use super::state_machine::PhaseStateMachine;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PlanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unstarted" => Some(Self::Unstarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Completed and rolled back plans can be archived.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted description of an operation.
///
/// The set of phases and their dependencies is fixed when the plan is
/// created. Only phase states change afterwards, through [`Plan::transition`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawPlan")]
pub struct Plan {
    key: OperationKey,
    kind: OperationKind,
    servers: Vec<Server>,
    phases: Vec<Phase>,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawPlan {
    key: OperationKey,
    kind: OperationKind,
    servers: Vec<Server>,
    phases: Vec<Phase>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RawPlan> for Plan {
    type Error = CoreError;

    fn try_from(raw: RawPlan) -> Result<Self> {
        Plan::restore(raw.key, raw.kind, raw.servers, raw.phases, raw.created_at)
    }
}

impl Plan {
    /// Create a plan with every phase unstarted.
    pub fn new(
        key: OperationKey,
        kind: OperationKind,
        servers: Vec<Server>,
        mut phases: Vec<Phase>,
    ) -> Result<Self> {
        let now = Utc::now();
        for phase in &mut phases {
            phase.state = PhaseState::Unstarted;
            phase.error = None;
            phase.updated_at = now;
        }
        Self::restore(key, kind, servers, phases, now)
    }

    /// Rebuild a plan from persisted parts, keeping the phase states.
    pub fn restore(
        key: OperationKey,
        kind: OperationKind,
        servers: Vec<Server>,
        phases: Vec<Phase>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let plan = Self {
            key,
            kind,
            servers,
            phases,
            created_at,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(CoreError::InvalidPlan("plan has no phases".to_string()));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !phase.id.starts_with('/') || phase.id.len() < 2 || phase.id.ends_with('/') {
                return Err(CoreError::InvalidPlan(format!(
                    "phase id {:?} is not an absolute path",
                    phase.id
                )));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(CoreError::InvalidPlan(format!(
                    "duplicate phase id {}",
                    phase.id
                )));
            }
        }

        for phase in &self.phases {
            for requirement in &phase.requires {
                let resolves = self
                    .phases
                    .iter()
                    .any(|other| other.id != phase.id && other.is_under(requirement));
                if !resolves {
                    return Err(CoreError::InvalidPlan(format!(
                        "phase {} requires unknown phase {}",
                        phase.id, requirement
                    )));
                }
            }
        }

        let ordered = self.topological_indices();
        if ordered.len() != self.phases.len() {
            return Err(CoreError::InvalidPlan(
                "phase dependencies contain a cycle".to_string(),
            ));
        }
        Ok(())
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.id == id)
    }

    pub fn masters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|server| server.is_master())
    }

    /// Overall state derived from the phase states.
    pub fn state(&self) -> PlanState {
        let has = |state: PhaseState| self.phases.iter().any(|phase| phase.state == state);

        if self
            .phases
            .iter()
            .all(|phase| phase.state == PhaseState::Completed)
        {
            PlanState::Completed
        } else if has(PhaseState::Failed) {
            PlanState::Failed
        } else if has(PhaseState::InProgress) || has(PhaseState::Completed) {
            PlanState::InProgress
        } else if has(PhaseState::RolledBack) {
            PlanState::RolledBack
        } else {
            PlanState::Unstarted
        }
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.phases
            .iter()
            .position(|phase| phase.id == id)
            .ok_or_else(|| CoreError::PhaseNotFound(id.to_string()))
    }

    fn dependency_indices(&self, index: usize) -> BTreeSet<usize> {
        let phase = &self.phases[index];
        let mut deps = BTreeSet::new();
        for requirement in &phase.requires {
            for (other, candidate) in self.phases.iter().enumerate() {
                if other != index && candidate.is_under(requirement) {
                    deps.insert(other);
                }
            }
        }
        deps
    }

    /// Direct dependencies of a phase, with group requirements expanded.
    pub fn dependencies(&self, id: &str) -> Result<Vec<&Phase>> {
        let index = self.index_of(id)?;
        Ok(self
            .dependency_indices(index)
            .into_iter()
            .map(|i| &self.phases[i])
            .collect())
    }

    /// Dependencies of a phase that are not completed yet.
    pub fn pending_dependencies(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .dependencies(id)?
            .into_iter()
            .filter(|dep| dep.state != PhaseState::Completed)
            .map(|dep| dep.id.clone())
            .collect())
    }

    /// Transitive dependents of a phase, in declaration order.
    pub fn dependents_of(&self, id: &str) -> Result<Vec<String>> {
        let root = self.index_of(id)?;
        let mut reached = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            for (index, _) in self.phases.iter().enumerate() {
                if !reached.contains(&index) && self.dependency_indices(index).contains(&current) {
                    reached.insert(index);
                    queue.push_back(index);
                }
            }
        }
        reached.remove(&root);
        Ok(self
            .phases
            .iter()
            .enumerate()
            .filter(|(index, _)| reached.contains(index))
            .map(|(_, phase)| phase.id.clone())
            .collect())
    }

    /// Phases eligible to start: unstarted, failed or rolled back, with
    /// every dependency completed. Failed and rolled back phases are included
    /// so a resumed plan runs them again. A plan that is completed or rolled
    /// back as a whole has no frontier.
    pub fn frontier(&self) -> Vec<&Phase> {
        if self.state().is_terminal() {
            return Vec::new();
        }
        let completed: BTreeSet<usize> = self
            .phases
            .iter()
            .enumerate()
            .filter(|(_, phase)| phase.state == PhaseState::Completed)
            .map(|(index, _)| index)
            .collect();

        self.phases
            .iter()
            .enumerate()
            .filter(|(_, phase)| {
                matches!(
                    phase.state,
                    PhaseState::Unstarted | PhaseState::Failed | PhaseState::RolledBack
                )
            })
            .filter(|(index, _)| self.dependency_indices(*index).is_subset(&completed))
            .map(|(_, phase)| phase)
            .collect()
    }

    fn topological_indices(&self) -> Vec<usize> {
        let deps: Vec<BTreeSet<usize>> = (0..self.phases.len())
            .map(|index| self.dependency_indices(index))
            .collect();
        let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (index, phase_deps) in deps.iter().enumerate() {
            for dep in phase_deps {
                dependents.entry(*dep).or_default().push(index);
            }
        }

        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(self.phases.len());
        while let Some(index) = ready.pop_first() {
            order.push(index);
            for dependent in dependents.get(&index).into_iter().flatten() {
                remaining[*dependent] -= 1;
                if remaining[*dependent] == 0 {
                    ready.insert(*dependent);
                }
            }
        }
        order
    }

    /// Phases ordered so every phase comes after its dependencies.
    /// Declaration order breaks ties.
    pub fn topological_order(&self) -> Vec<&Phase> {
        self.topological_indices()
            .into_iter()
            .map(|index| &self.phases[index])
            .collect()
    }

    /// Move a phase to a new state.
    ///
    /// Starting a phase requires every dependency to be completed.
    pub fn transition(&mut self, id: &str, to: PhaseState, error: Option<String>) -> Result<&Phase> {
        let index = self.index_of(id)?;
        let from = self.phases[index].state;
        PhaseStateMachine::validate_transition(id, &from, &to)?;

        if to == PhaseState::InProgress {
            let pending = self.pending_dependencies(id)?;
            if !pending.is_empty() {
                return Err(CoreError::DependenciesIncomplete {
                    phase: id.to_string(),
                    pending,
                });
            }
        }

        let phase = &mut self.phases[index];
        phase.state = to;
        phase.error = match to {
            PhaseState::Failed => error,
            PhaseState::RolledBack => error.or(phase.error.take()),
            _ => None,
        };
        phase.updated_at = Utc::now();
        Ok(&self.phases[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterRole, PhaseData, PhaseKind};

    fn servers() -> Vec<Server> {
        vec![
            Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master),
            Server::new("node-2", "10.0.0.2", "worker", ClusterRole::Node),
        ]
    }

    fn sample_plan() -> Plan {
        let phases = vec![
            Phase::new("/wait", "Wait for control plane", PhaseKind::Wait),
            Phase::new("/nodes/node-1", "Label node-1", PhaseKind::Nodes)
                .with_data(PhaseData::for_server(servers()[0].clone()))
                .requires(["/wait"]),
            Phase::new("/nodes/node-2", "Label node-2", PhaseKind::Nodes)
                .with_data(PhaseData::for_server(servers()[1].clone()))
                .requires(["/wait"]),
            Phase::new("/rbac", "Create RBAC resources", PhaseKind::Rbac).requires(["/wait"]),
            Phase::new("/app", "Run app hooks", PhaseKind::App).requires(["/nodes", "/rbac"]),
        ];
        Plan::new(
            OperationKey::new("test"),
            OperationKind::Install,
            servers(),
            phases,
        )
        .unwrap()
    }

    #[test]
    fn test_new_plan_is_unstarted() {
        let plan = sample_plan();
        assert_eq!(plan.state(), PlanState::Unstarted);
        assert_eq!(plan.masters().count(), 1);
        assert!(plan
            .phases()
            .iter()
            .all(|p| p.state == PhaseState::Unstarted));
    }

    #[test]
    fn test_rejects_unknown_requirement() {
        let phases = vec![Phase::new("/app", "app", PhaseKind::App).requires(["/missing"])];
        let err = Plan::new(OperationKey::new("t"), OperationKind::Install, vec![], phases)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPlan(_)));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let phases = vec![
            Phase::new("/wait", "wait", PhaseKind::Wait),
            Phase::new("/wait", "wait again", PhaseKind::Wait),
        ];
        assert!(Plan::new(OperationKey::new("t"), OperationKind::Install, vec![], phases).is_err());
    }

    #[test]
    fn test_rejects_cycle() {
        let phases = vec![
            Phase::new("/a", "a", PhaseKind::Wait).requires(["/b"]),
            Phase::new("/b", "b", PhaseKind::Wait).requires(["/a"]),
        ];
        let err = Plan::new(OperationKey::new("t"), OperationKind::Install, vec![], phases)
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_relative_ids() {
        let phases = vec![Phase::new("wait", "wait", PhaseKind::Wait)];
        assert!(Plan::new(OperationKey::new("t"), OperationKind::Install, vec![], phases).is_err());
    }

    #[test]
    fn test_group_dependencies_expand() {
        let plan = sample_plan();
        let deps: Vec<&str> = plan
            .dependencies("/app")
            .unwrap()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(deps, vec!["/nodes/node-1", "/nodes/node-2", "/rbac"]);
    }

    #[test]
    fn test_frontier_follows_dependencies() {
        let mut plan = sample_plan();
        let ids = |plan: &Plan| -> Vec<String> {
            plan.frontier().iter().map(|p| p.id.clone()).collect()
        };
        assert_eq!(ids(&plan), vec!["/wait"]);

        plan.transition("/wait", PhaseState::InProgress, None).unwrap();
        assert!(ids(&plan).is_empty());
        plan.transition("/wait", PhaseState::Completed, None).unwrap();
        assert_eq!(ids(&plan), vec!["/nodes/node-1", "/nodes/node-2", "/rbac"]);
    }

    #[test]
    fn test_rolled_back_phase_rejoins_frontier() {
        let mut plan = sample_plan();
        plan.transition("/wait", PhaseState::InProgress, None).unwrap();
        plan.transition("/wait", PhaseState::Completed, None).unwrap();
        plan.transition("/rbac", PhaseState::InProgress, None).unwrap();
        plan.transition("/rbac", PhaseState::Completed, None).unwrap();
        plan.transition("/rbac", PhaseState::RolledBack, None).unwrap();

        let ids: Vec<&str> = plan.frontier().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["/nodes/node-1", "/nodes/node-2", "/rbac"]);

        // once everything is rolled back the plan is finished
        plan.transition("/wait", PhaseState::RolledBack, None).unwrap();
        assert_eq!(plan.state(), PlanState::RolledBack);
        assert!(plan.frontier().is_empty());
    }

    #[test]
    fn test_cannot_start_with_pending_dependencies() {
        let mut plan = sample_plan();
        let err = plan
            .transition("/rbac", PhaseState::InProgress, None)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::DependenciesIncomplete {
                phase: "/rbac".to_string(),
                pending: vec!["/wait".to_string()],
            }
        );
    }

    #[test]
    fn test_cannot_skip_in_progress() {
        let mut plan = sample_plan();
        assert!(plan
            .transition("/wait", PhaseState::Completed, None)
            .is_err());
    }

    #[test]
    fn test_failure_records_error() {
        let mut plan = sample_plan();
        plan.transition("/wait", PhaseState::InProgress, None).unwrap();
        let phase = plan
            .transition("/wait", PhaseState::Failed, Some("timed out".to_string()))
            .unwrap();
        assert_eq!(phase.error.as_deref(), Some("timed out"));
        assert_eq!(plan.state(), PlanState::Failed);
        assert_eq!(plan.frontier()[0].id, "/wait");
    }

    #[test]
    fn test_dependents_are_transitive() {
        let plan = sample_plan();
        assert_eq!(
            plan.dependents_of("/wait").unwrap(),
            vec!["/nodes/node-1", "/nodes/node-2", "/rbac", "/app"]
        );
        assert_eq!(plan.dependents_of("/rbac").unwrap(), vec!["/app"]);
        assert!(plan.dependents_of("/app").unwrap().is_empty());
    }

    #[test]
    fn test_topological_order() {
        let plan = sample_plan();
        let order: Vec<&str> = plan
            .topological_order()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(
            order,
            vec!["/wait", "/nodes/node-1", "/nodes/node-2", "/rbac", "/app"]
        );
    }

    #[test]
    fn test_plan_state_derivation() {
        let mut plan = sample_plan();
        plan.transition("/wait", PhaseState::InProgress, None).unwrap();
        assert_eq!(plan.state(), PlanState::InProgress);
        plan.transition("/wait", PhaseState::Completed, None).unwrap();
        assert_eq!(plan.state(), PlanState::InProgress);
        plan.transition("/wait", PhaseState::RolledBack, None).unwrap();
        assert_eq!(plan.state(), PlanState::RolledBack);
    }

    #[test]
    fn test_serde_round_trip_keeps_states() {
        let mut plan = sample_plan();
        plan.transition("/wait", PhaseState::InProgress, None).unwrap();
        plan.transition("/wait", PhaseState::Completed, None).unwrap();

        let json = serde_json::to_string(&plan).unwrap();
        let restored: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, plan);
        assert_eq!(restored.phase("/wait").unwrap().state, PhaseState::Completed);
    }

    #[test]
    fn test_deserialize_rejects_invalid_structure() {
        let json = serde_json::json!({
            "key": OperationKey::new("t"),
            "kind": "install",
            "servers": [],
            "phases": [],
            "created_at": Utc::now(),
        });
        assert!(serde_json::from_value::<Plan>(json).is_err());
    }
}

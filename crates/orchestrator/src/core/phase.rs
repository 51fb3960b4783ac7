//! Phase executor contract.
//!
//! Every phase kind implements [`PhaseExecutor`]. An executor is built for a
//! single invocation from the phase parameters and the shared services, and
//! owns no state across invocations. Durable state lives in the plan, which
//! only the engine writes.

use async_trait::async_trait;
use installer_core::{
    Locator, OperationKey, OperationKind, Phase, PhaseKind, Server, ServiceUser,
};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;

/// Per-invocation context handed to every executor method.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

/// Everything an executor is constructed from.
#[derive(Debug, Clone)]
pub struct ExecutorParams {
    pub key: OperationKey,
    pub operation: OperationKind,
    pub phase: Phase,
    /// Every server of the plan
    pub servers: Vec<Server>,
    pub progress: ProgressReporter,
}

impl ExecutorParams {
    pub fn server(&self) -> Option<&Server> {
        self.phase.server()
    }

    pub fn require_server(&self) -> Result<Server> {
        self.server().cloned().ok_or_else(|| {
            OrchestratorError::BadParameter(format!("phase {} requires a target server", self.phase.id))
        })
    }

    pub fn require_package(&self) -> Result<Locator> {
        self.phase.data.package.clone().ok_or_else(|| {
            OrchestratorError::BadParameter(format!(
                "phase {} requires an application package",
                self.phase.id
            ))
        })
    }

    pub fn require_service_user(&self) -> Result<ServiceUser> {
        self.phase.data.service_user.clone().ok_or_else(|| {
            OrchestratorError::BadParameter(format!(
                "phase {} requires a service user",
                self.phase.id
            ))
        })
    }
}

/// Lifecycle of one phase.
///
/// `execute` may be invoked again after a partial failure, so it must either
/// change nothing when it fails or make idempotent changes only.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn kind(&self) -> PhaseKind;

    /// Validate preconditions without touching the cluster.
    async fn pre_check(&self, ctx: &ExecContext) -> Result<()>;

    async fn execute(&self, ctx: &ExecContext) -> Result<()>;

    /// Undo a completed `execute`. Most phases are not practically
    /// reversible and leave this a no-op.
    async fn rollback(&self, ctx: &ExecContext) -> Result<()>;

    /// Confirm `execute` converged.
    async fn post_check(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

/// Require the phase to run against a master.
///
/// With a target server the server itself must be a master, otherwise the
/// plan needs at least one.
pub fn check_master_server(target: Option<&Server>, servers: &[Server]) -> Result<()> {
    match target {
        Some(server) if !server.is_master() => Err(OrchestratorError::Precondition(format!(
            "phase must run on a master server, {server} has role {}",
            server.cluster_role
        ))),
        Some(_) => Ok(()),
        None if servers.iter().any(Server::is_master) => Ok(()),
        None => Err(OrchestratorError::Precondition(
            "at least one master server is required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_core::ClusterRole;

    #[test]
    fn test_master_check_on_target() {
        let master = Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master);
        let worker = Server::new("node-2", "10.0.0.2", "worker", ClusterRole::Node);
        let servers = vec![master.clone(), worker.clone()];

        assert!(check_master_server(Some(&master), &servers).is_ok());
        let err = check_master_server(Some(&worker), &servers).unwrap_err();
        assert!(matches!(err, OrchestratorError::Precondition(_)));
        assert!(err.to_string().contains("node-2(10.0.0.2)"));
    }

    #[test]
    fn test_master_check_on_plan() {
        let worker = Server::new("node-2", "10.0.0.2", "worker", ClusterRole::Node);
        assert!(check_master_server(None, &[]).is_err());
        assert!(check_master_server(None, &[worker]).is_err());
    }
}

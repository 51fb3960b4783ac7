//! Wait for the control-plane runtime to come up on every server.

use async_trait::async_trait;
use installer_core::{PhaseKind, Server};
use std::sync::Arc;
use tracing::debug;

use crate::core::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;
use crate::retry::{retry, RetryPolicy};
use crate::services::{ClusterStatus, Services};

pub struct WaitExecutor {
    server: Option<Server>,
    servers: Vec<Server>,
    status: Arc<dyn ClusterStatus>,
    policy: RetryPolicy,
    progress: ProgressReporter,
}

impl WaitExecutor {
    pub fn new(params: ExecutorParams, services: &Services) -> Self {
        Self {
            server: params.server().cloned(),
            servers: params.servers,
            status: Arc::clone(&services.status),
            policy: services.settings.wait_retry,
            progress: params.progress,
        }
    }

    async fn check_status(&self) -> Result<()> {
        let status = self.status.status().await?;
        debug!(nodes = status.nodes.len(), running = status.running, "Control plane status");
        if status.nodes.len() != self.servers.len() {
            return Err(OrchestratorError::NotReady(format!(
                "{} of {} servers joined the cluster",
                status.nodes.len(),
                self.servers.len()
            )));
        }
        if !status.running {
            return Err(OrchestratorError::NotReady(
                "control plane is not running yet".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseExecutor for WaitExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Wait
    }

    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        check_master_server(self.server.as_ref(), &self.servers)
    }

    async fn execute(&self, ctx: &ExecContext) -> Result<()> {
        self.progress.next_step("Waiting for the control plane to start");
        retry(&self.policy, &ctx.cancel, "waiting for the control plane", || {
            self.check_status()
        })
        .await?;
        self.progress.next_step("Control plane is up");
        Ok(())
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing;
    use crate::services::SystemStatus;
    use installer_core::{Phase, PhaseData};
    use std::time::Duration;

    fn phase() -> Phase {
        Phase::new("/wait", "Wait for the control plane", PhaseKind::Wait)
            .with_data(PhaseData::for_server(testing::master()))
    }

    #[tokio::test]
    async fn test_running_cluster() {
        let fixture = testing::Fixture::new();
        fixture.kube.set_status(SystemStatus {
            nodes: vec!["node-1".into(), "node-2".into()],
            running: true,
        });
        let executor = WaitExecutor::new(fixture.params(phase()), &fixture.services);
        executor.execute(&ExecContext::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_naming_what_it_waited_for() {
        let mut fixture = testing::Fixture::new();
        fixture.services.settings.wait_retry = RetryPolicy::fixed(Duration::from_secs(1), 3);
        fixture.kube.set_status(SystemStatus {
            nodes: vec!["node-1".into()],
            running: true,
        });

        let executor = WaitExecutor::new(fixture.params(phase()), &fixture.services);
        let err = executor.execute(&ExecContext::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RetryExhausted { attempts: 3, .. }));
        assert!(err.to_string().contains("waiting for the control plane"));
        assert!(err.to_string().contains("1 of 2 servers"));
    }

    #[tokio::test]
    async fn test_worker_target_fails_pre_check() {
        let fixture = testing::Fixture::new();
        let phase = Phase::new("/wait", "Wait", PhaseKind::Wait)
            .with_data(PhaseData::for_server(testing::worker()));
        let executor = WaitExecutor::new(fixture.params(phase), &fixture.services);
        let err = executor.pre_check(&ExecContext::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Precondition(_)));
    }
}

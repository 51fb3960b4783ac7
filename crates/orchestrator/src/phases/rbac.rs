use async_trait::async_trait;
use installer_core::{Locator, PhaseKind, Server};
use std::sync::Arc;

use crate::core::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::Result;
use crate::progress::ProgressReporter;
use crate::services::{Applications, KubeClient, Services};

/// Creates the bootstrap RBAC resources shipped with the package.
///
/// Rollback is a no-op: the next corrective operation replaces the
/// resources.
pub struct RbacExecutor {
    package: Locator,
    server: Option<Server>,
    servers: Vec<Server>,
    apps: Arc<dyn Applications>,
    kube: Arc<dyn KubeClient>,
    progress: ProgressReporter,
}

impl RbacExecutor {
    pub fn new(params: ExecutorParams, services: &Services) -> Result<Self> {
        Ok(Self {
            package: params.require_package()?,
            server: params.server().cloned(),
            servers: params.servers,
            apps: Arc::clone(&services.apps),
            kube: Arc::clone(&services.kube),
            progress: params.progress,
        })
    }
}

#[async_trait]
impl PhaseExecutor for RbacExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Rbac
    }

    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        check_master_server(self.server.as_ref(), &self.servers)
    }

    async fn execute(&self, _ctx: &ExecContext) -> Result<()> {
        self.progress
            .next_step(format!("Creating bootstrap resources of {}", self.package));
        let resources = self.apps.get_app_resources(&self.package).await?;
        self.kube.apply(&resources).await
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing;
    use crate::services::InMemoryApplications;
    use installer_core::{Phase, PhaseData};

    #[tokio::test]
    async fn test_applies_package_resources() {
        let fixture = testing::Fixture::with_apps(
            InMemoryApplications::new()
                .with_resources(testing::package(), "kind: ClusterRole\n"),
        );
        let phase = Phase::new("/rbac", "Create RBAC resources", PhaseKind::Rbac).with_data(
            PhaseData {
                package: Some(testing::package()),
                ..PhaseData::for_server(testing::master())
            },
        );

        let executor = RbacExecutor::new(fixture.params(phase), &fixture.services).unwrap();
        executor.execute(&ExecContext::default()).await.unwrap();
        assert_eq!(fixture.kube.applied(), vec![b"kind: ClusterRole\n".to_vec()]);
    }
}

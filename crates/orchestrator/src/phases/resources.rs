use async_trait::async_trait;
use installer_core::{PhaseKind, Server};
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;
use crate::services::{KubeClient, Services};

/// Applies the user supplied Kubernetes resources.
///
/// The resources are kept under the state directory so they can be
/// inspected and re-applied by hand.
pub struct ResourcesExecutor {
    resources: Vec<u8>,
    path: PathBuf,
    server: Option<Server>,
    servers: Vec<Server>,
    kube: Arc<dyn KubeClient>,
    progress: ProgressReporter,
}

impl ResourcesExecutor {
    pub fn new(params: ExecutorParams, services: &Services) -> Result<Self> {
        let resources = params
            .phase
            .data
            .resources
            .clone()
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| {
                OrchestratorError::BadParameter(format!(
                    "phase {} requires resources to apply",
                    params.phase.id
                ))
            })?;
        Ok(Self {
            resources,
            path: services
                .settings
                .state_dir
                .join("share")
                .join("resources.yaml"),
            server: params.server().cloned(),
            servers: params.servers,
            kube: Arc::clone(&services.kube),
            progress: params.progress,
        })
    }
}

#[async_trait]
impl PhaseExecutor for ResourcesExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Resources
    }

    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        check_master_server(self.server.as_ref(), &self.servers)
    }

    async fn execute(&self, _ctx: &ExecContext) -> Result<()> {
        self.progress.next_step("Creating user-supplied Kubernetes resources");
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.path, &self.resources).await?;
        self.kube.apply_file(&self.path).await
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

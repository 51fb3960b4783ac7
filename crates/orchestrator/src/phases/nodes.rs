//! Labels and taints for the Kubernetes node of one server.

use async_trait::async_trait;
use installer_core::{PhaseKind, Server, Taint};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;
use crate::retry::{retry, RetryPolicy};
use crate::services::{KubeClient, Node, Services, ADVERTISE_IP_LABEL, ROLE_LABEL};

pub struct NodesExecutor {
    server: Server,
    servers: Vec<Server>,
    labels: BTreeMap<String, String>,
    taints: Vec<Taint>,
    kube: Arc<dyn KubeClient>,
    label_retry: RetryPolicy,
    registration_retry: RetryPolicy,
    progress: ProgressReporter,
}

impl NodesExecutor {
    /// Resolve the node profile of the target server from the package
    /// manifest.
    ///
    /// The role label is written only when the profile names it, and always
    /// carries the server's cluster role. The profile's taints replace the
    /// taints of the node.
    pub async fn new(params: ExecutorParams, services: &Services) -> Result<Self> {
        let server = params.require_server()?;
        let package = params.require_package()?;
        let app = services.apps.get_app(&package).await?;
        let profile = app.manifest.node_profile(&server.role).map_err(|_| {
            OrchestratorError::BadParameter(format!(
                "package {package} has no node profile {:?} for {server}",
                server.role
            ))
        })?;

        let mut labels = profile.labels.clone();
        labels.extend(params.phase.data.labels.clone());
        if let Some(role) = labels.get_mut(ROLE_LABEL) {
            *role = server.cluster_role.to_string();
        }
        labels.insert(ADVERTISE_IP_LABEL.to_string(), server.advertise_ip.clone());

        let mut taints = profile.taints.clone();
        for taint in &params.phase.data.taints {
            if !taints.contains(taint) {
                taints.push(taint.clone());
            }
        }

        Ok(Self {
            server,
            servers: params.servers,
            labels,
            taints,
            kube: Arc::clone(&services.kube),
            label_retry: services.settings.label_retry,
            registration_retry: services.settings.registration_retry,
            progress: params.progress,
        })
    }

    fn is_converged(&self, node: &Node) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| node.labels.get(key) == Some(value))
            && node.taints.len() == self.taints.len()
            && self.taints.iter().all(|taint| node.taints.contains(taint))
    }

    async fn check_registered(&self) -> Result<()> {
        let nodes = self.kube.list_nodes().await?;
        for server in &self.servers {
            crate::services::find_node(&nodes, server)
                .map_err(|_| OrchestratorError::NotReady(format!("{server} is not registered")))?;
        }
        Ok(())
    }

    /// One read-modify-write of the node object.
    async fn update(&self) -> Result<()> {
        let mut node = self.kube.get_node(&self.server).await?;
        if self.is_converged(&node) {
            debug!(node = %node.name, "Node already labeled");
            return Ok(());
        }
        node.labels.extend(self.labels.clone());
        node.taints = self.taints.clone();
        self.kube.update_node(&node).await?;
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        let node = self.kube.get_node(&self.server).await?;
        if !self.is_converged(&node) {
            return Err(OrchestratorError::NotReady(format!(
                "node {} does not carry its labels yet",
                node.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseExecutor for NodesExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Nodes
    }

    async fn pre_check(&self, ctx: &ExecContext) -> Result<()> {
        check_master_server(None, &self.servers)?;
        retry(
            &self.registration_retry,
            &ctx.cancel,
            "waiting for kubernetes nodes to register",
            || self.check_registered(),
        )
        .await
    }

    async fn execute(&self, ctx: &ExecContext) -> Result<()> {
        self.progress
            .next_step(format!("Updating labels and taints of {}", self.server));
        let what = format!("updating node of {}", self.server);
        retry(&self.label_retry, &ctx.cancel, &what, || self.update()).await
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }

    async fn post_check(&self, ctx: &ExecContext) -> Result<()> {
        let what = format!("verifying node of {}", self.server);
        retry(&self.label_retry, &ctx.cancel, &what, || self.verify()).await
    }
}

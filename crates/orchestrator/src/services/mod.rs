//! Collaborators the phase executors drive.

pub mod apps;
pub mod kube;
pub mod operator;

pub use apps::{
    Application, Applications, HookRequest, HookType, HookWriter, InMemoryApplications,
    LocalApplications, Manifest,
};
pub use kube::{
    find_node, ClusterStatus, InMemoryKube, KubeClient, Kubectl, Node, SystemStatus,
    ADVERTISE_IP_LABEL, HOSTNAME_LABEL, ROLE_LABEL,
};
pub use operator::{InMemoryOperator, LogReader, Operator, SqliteOperator};

use std::path::PathBuf;
use std::sync::Arc;

use crate::retry::RetryPolicy;

/// Retry budgets and paths the executors share.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Directory the installer writes its state to
    pub state_dir: PathBuf,
    /// Waiting for the control plane to converge
    pub wait_retry: RetryPolicy,
    /// Node label and taint updates
    pub label_retry: RetryPolicy,
    /// Waiting for Kubernetes nodes to register
    pub registration_retry: RetryPolicy,
}

impl ExecutorSettings {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            wait_retry: RetryPolicy::standard(),
            label_retry: RetryPolicy::less(),
            registration_retry: RetryPolicy::node_registration(),
        }
    }
}

/// Shared handles every executor is built from.
#[derive(Clone)]
pub struct Services {
    pub operator: Arc<dyn Operator>,
    pub apps: Arc<dyn Applications>,
    pub kube: Arc<dyn KubeClient>,
    pub status: Arc<dyn ClusterStatus>,
    pub settings: ExecutorSettings,
}

impl Services {
    pub fn new(
        operator: Arc<dyn Operator>,
        apps: Arc<dyn Applications>,
        kube: Arc<dyn KubeClient>,
        status: Arc<dyn ClusterStatus>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            operator,
            apps,
            kube,
            status,
            settings,
        }
    }
}

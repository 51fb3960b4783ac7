//! Kubernetes access used by the node, RBAC and resource phases.

use async_trait::async_trait;
use installer_core::{Server, Taint};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Label carrying the advertise address of a node.
pub const ADVERTISE_IP_LABEL: &str = "gravitational.io/advertise-ip";
/// Legacy label nodes were matched by before the advertise address label.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
/// Label holding the cluster role of a node.
pub const ROLE_LABEL: &str = "gravitational.io/k8s-role";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Version the update is conditioned on
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub ready: bool,
}

/// Find the node of `server`, first by advertise address, then by hostname.
pub fn find_node<'a>(nodes: &'a [Node], server: &Server) -> Result<&'a Node> {
    let by_label = |label: &str, value: &str| {
        nodes
            .iter()
            .find(|node| node.labels.get(label).map(String::as_str) == Some(value))
    };
    by_label(ADVERTISE_IP_LABEL, &server.advertise_ip)
        .or_else(|| by_label(HOSTNAME_LABEL, &server.hostname))
        .ok_or_else(|| OrchestratorError::NotFound(format!("Kubernetes node for {server}")))
}

#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn get_node(&self, server: &Server) -> Result<Node> {
        let nodes = self.list_nodes().await?;
        find_node(&nodes, server).cloned()
    }

    /// Replace labels and taints of a node.
    ///
    /// Fails with `Conflict` when the node changed since it was read.
    async fn update_node(&self, node: &Node) -> Result<Node>;

    /// Create or update the objects of a manifest.
    async fn apply(&self, manifest: &[u8]) -> Result<()>;

    async fn apply_file(&self, path: &Path) -> Result<()> {
        let manifest = tokio::fs::read(path).await?;
        self.apply(&manifest).await
    }
}

/// Control-plane health as seen by the node agents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemStatus {
    pub nodes: Vec<String>,
    pub running: bool,
}

#[async_trait]
pub trait ClusterStatus: Send + Sync {
    async fn status(&self) -> Result<SystemStatus>;
}

/// Client shelling out to `kubectl`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    /// Looked up on the `PATH` at each call when not set
    binary: Option<PathBuf>,
    kubeconfig: Option<PathBuf>,
}

impl Kubectl {
    /// Client using the `kubectl` found on the `PATH` when first needed.
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            binary: None,
            kubeconfig,
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
            kubeconfig,
        }
    }

    fn binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(binary) => Ok(binary.clone()),
            None => which::which("kubectl")
                .map_err(|e| OrchestratorError::NotFound(format!("kubectl binary: {e}"))),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let binary = self.binary()?;
        let mut command = Command::new(&binary);
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(binary = %binary.display(), ?args, "Running kubectl");

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("the object has been modified") || stderr.contains("Conflict") {
            Err(OrchestratorError::Conflict(stderr))
        } else if stderr.contains("NotFound") || stderr.contains("not found") {
            Err(OrchestratorError::NotFound(stderr))
        } else {
            Err(OrchestratorError::Kubernetes(format!(
                "kubectl {} exited with {}: {stderr}",
                args.first().copied().unwrap_or_default(),
                output.status
            )))
        }
    }
}

fn node_from_json(item: &Value) -> Result<Node> {
    let metadata = &item["metadata"];
    let name = metadata["name"]
        .as_str()
        .ok_or_else(|| OrchestratorError::Serialization("node without a name".to_string()))?;
    let labels = match metadata.get("labels") {
        Some(labels) => serde_json::from_value(labels.clone())?,
        None => BTreeMap::new(),
    };
    let taints = match item["spec"].get("taints") {
        Some(taints) => serde_json::from_value(taints.clone())?,
        None => Vec::new(),
    };
    let ready = item["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Ready" && c["status"] == "True")
        })
        .unwrap_or(false);

    Ok(Node {
        name: name.to_string(),
        labels,
        taints,
        resource_version: metadata["resourceVersion"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        ready,
    })
}

#[async_trait]
impl KubeClient for Kubectl {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let out = self.run(&["get", "nodes", "-o", "json"], None).await?;
        let list: Value = serde_json::from_slice(&out)?;
        list["items"]
            .as_array()
            .map(|items| items.iter().map(node_from_json).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        // the resource version turns the merge patch into a conditional update
        let patch = json!({
            "metadata": {
                "resourceVersion": node.resource_version,
                "labels": node.labels,
            },
            "spec": { "taints": node.taints },
        });
        let out = self
            .run(
                &[
                    "patch",
                    "node",
                    &node.name,
                    "--type=merge",
                    "-o",
                    "json",
                    "-p",
                    &patch.to_string(),
                ],
                None,
            )
            .await?;
        node_from_json(&serde_json::from_slice(&out)?)
    }

    async fn apply(&self, manifest: &[u8]) -> Result<()> {
        self.run(&["apply", "-f", "-"], Some(manifest)).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStatus for Kubectl {
    async fn status(&self) -> Result<SystemStatus> {
        let nodes = self.list_nodes().await?;
        Ok(SystemStatus {
            running: !nodes.is_empty() && nodes.iter().all(|node| node.ready),
            nodes: nodes.into_iter().map(|node| node.name).collect(),
        })
    }
}

#[derive(Debug, Default)]
struct KubeState {
    nodes: BTreeMap<String, Node>,
    applied: Vec<Vec<u8>>,
    conflicts: u32,
    version: u64,
}

/// In-memory cluster used by tests.
#[derive(Debug, Default)]
pub struct InMemoryKube {
    state: Mutex<KubeState>,
    status: Mutex<SystemStatus>,
}

fn poisoned<T>(_: T) -> OrchestratorError {
    OrchestratorError::Kubernetes("cluster state lock poisoned".to_string())
}

impl InMemoryKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the node of `server` the way the kubelet would.
    pub fn register(&self, server: &Server) {
        if let Ok(mut state) = self.state.lock() {
            state.version += 1;
            let node = Node {
                name: server.hostname.clone(),
                labels: BTreeMap::from([(HOSTNAME_LABEL.to_string(), server.hostname.clone())]),
                taints: Vec::new(),
                resource_version: state.version.to_string(),
                ready: true,
            };
            state.nodes.insert(node.name.clone(), node);
        }
    }

    /// Make the next `count` node updates fail with a conflict.
    pub fn fail_updates(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.conflicts = count;
        }
    }

    pub fn set_status(&self, status: SystemStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.nodes.get(name).cloned())
    }

    /// Manifests applied so far, in order.
    pub fn applied(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|state| state.applied.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KubeClient for InMemoryKube {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            state.version += 1;
            let version = state.version.to_string();
            if let Some(current) = state.nodes.get_mut(&node.name) {
                current.resource_version = version;
            }
        }

        let version = state.version + 1;
        let current = state
            .nodes
            .get_mut(&node.name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {}", node.name)))?;
        if current.resource_version != node.resource_version {
            return Err(OrchestratorError::Conflict(format!(
                "node {} has been modified",
                node.name
            )));
        }
        current.labels = node.labels.clone();
        current.taints = node.taints.clone();
        current.resource_version = version.to_string();
        let updated = current.clone();
        state.version = version;
        Ok(updated)
    }

    async fn apply(&self, manifest: &[u8]) -> Result<()> {
        self.state
            .lock()
            .map_err(poisoned)?
            .applied
            .push(manifest.to_vec());
        Ok(())
    }
}

#[async_trait]
impl ClusterStatus for InMemoryKube {
    async fn status(&self) -> Result<SystemStatus> {
        Ok(self.status.lock().map_err(poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_core::ClusterRole;

    fn server() -> Server {
        Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master)
    }

    #[test]
    fn test_find_node_prefers_advertise_ip() {
        let nodes = vec![
            Node {
                name: "by-hostname".into(),
                labels: BTreeMap::from([(HOSTNAME_LABEL.into(), "node-1".into())]),
                ..Default::default()
            },
            Node {
                name: "by-ip".into(),
                labels: BTreeMap::from([(ADVERTISE_IP_LABEL.into(), "10.0.0.1".into())]),
                ..Default::default()
            },
        ];
        assert_eq!(find_node(&nodes, &server()).unwrap().name, "by-ip");
        assert_eq!(find_node(&nodes[..1], &server()).unwrap().name, "by-hostname");
        assert!(find_node(&[], &server()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_node_from_kubectl_json() {
        let item = json!({
            "metadata": {
                "name": "node-1",
                "resourceVersion": "42",
                "labels": { "kubernetes.io/hostname": "node-1" },
            },
            "spec": { "taints": [{ "key": "dedicated", "value": "db", "effect": "NoSchedule" }] },
            "status": { "conditions": [{ "type": "Ready", "status": "True" }] },
        });
        let node = node_from_json(&item).unwrap();
        assert_eq!(node.name, "node-1");
        assert_eq!(node.resource_version, "42");
        assert_eq!(node.taints[0].effect, "NoSchedule");
        assert!(node.ready);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let kube = InMemoryKube::new();
        kube.register(&server());

        let mut node = kube.get_node(&server()).await.unwrap();
        node.labels.insert(ROLE_LABEL.into(), "master".into());
        let updated = kube.update_node(&node).await.unwrap();
        assert_ne!(updated.resource_version, node.resource_version);

        // the first write bumped the version
        let err = kube.update_node(&node).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let kube = InMemoryKube::new();
        kube.register(&server());
        kube.fail_updates(1);

        let node = kube.get_node(&server()).await.unwrap();
        assert!(kube.update_node(&node).await.is_err());
        let node = kube.get_node(&server()).await.unwrap();
        assert!(kube.update_node(&node).await.is_ok());
    }
}

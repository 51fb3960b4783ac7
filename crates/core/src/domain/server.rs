use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Role a server plays in the Kubernetes cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRole {
    Master,
    #[default]
    Node,
}

impl ClusterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Node => "node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "master" => Some(Self::Master),
            "node" => Some(Self::Node),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine participating in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Server {
    pub hostname: String,
    pub advertise_ip: String,
    /// Node profile name from the application manifest
    pub role: String,
    pub cluster_role: ClusterRole,
}

impl Server {
    pub fn new(
        hostname: impl Into<String>,
        advertise_ip: impl Into<String>,
        role: impl Into<String>,
        cluster_role: ClusterRole,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_ip: advertise_ip.into(),
            role: role.into(),
            cluster_role,
        }
    }

    pub fn is_master(&self) -> bool {
        self.cluster_role == ClusterRole::Master
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.hostname, self.advertise_ip)
    }
}

/// Identity used to run services and hooks on the nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl ServiceUser {
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
        }
    }
}

/// Reference to an application package: `repository/name:version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: String,
}

impl Locator {
    pub fn new(
        repository: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || {
            CoreError::Validation(format!(
                "invalid package locator {s:?}, expected repository/name:version"
            ))
        };
        let (repository, rest) = s.split_once('/').ok_or_else(invalid)?;
        let (name, version) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if repository.is_empty() || name.is_empty() || version.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(repository, name, version))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

/// Kind of cluster operation a plan carries out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Install,
    Upgrade,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "install" => Some(Self::Install),
            "upgrade" => Some(Self::Upgrade),
            _ => None,
        }
    }
}

/// Unique key of an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub cluster: String,
    pub operation_id: Uuid,
}

impl OperationKey {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            operation_id: Uuid::new_v4(),
        }
    }

    pub fn with_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = operation_id;
        self
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parse() {
        let loc = Locator::parse("gravitational.io/telekube:5.2.1").unwrap();
        assert_eq!(loc.repository, "gravitational.io");
        assert_eq!(loc.name, "telekube");
        assert_eq!(loc.version, "5.2.1");
        assert_eq!(loc.to_string(), "gravitational.io/telekube:5.2.1");
    }

    #[test]
    fn test_locator_parse_invalid() {
        assert!(Locator::parse("telekube:5.2.1").is_err());
        assert!(Locator::parse("gravitational.io/telekube").is_err());
        assert!(Locator::parse("repo/:1.0").is_err());
    }

    #[test]
    fn test_cluster_role_parse() {
        assert_eq!(ClusterRole::parse("master"), Some(ClusterRole::Master));
        assert_eq!(ClusterRole::parse("node"), Some(ClusterRole::Node));
        assert_eq!(ClusterRole::parse("worker"), None);
    }

    #[test]
    fn test_server_is_master() {
        let master = Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master);
        let node = Server::new("node-2", "10.0.0.2", "worker", ClusterRole::Node);
        assert!(master.is_master());
        assert!(!node.is_master());
        assert_eq!(master.to_string(), "node-1(10.0.0.1)");
    }

    #[test]
    fn test_operation_key_display() {
        let id = Uuid::new_v4();
        let key = OperationKey::new("prod").with_id(id);
        assert_eq!(key.to_string(), format!("prod/{id}"));
    }
}

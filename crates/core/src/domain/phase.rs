use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::server::{Locator, Server, ServiceUser};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
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
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag selecting the executor for a phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Validate storage requirements on the installer node
    Checks,
    /// Apply DNS overrides to the cluster
    Dns,
    /// Wait for the control-plane runtime to come up on every server
    Wait,
    /// Label and taint Kubernetes nodes
    Nodes,
    /// Create bootstrap RBAC resources from the application package
    Rbac,
    /// Apply user-supplied Kubernetes resources
    Resources,
    /// Run application lifecycle hooks
    App,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 7] = [
        Self::Checks,
        Self::Dns,
        Self::Wait,
        Self::Nodes,
        Self::Rbac,
        Self::Resources,
        Self::App,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checks => "checks",
            Self::Dns => "dns",
            Self::Wait => "wait",
            Self::Nodes => "nodes",
            Self::Rbac => "rbac",
            Self::Resources => "resources",
            Self::App => "app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: String,
}

/// Labels and taints applied to every node with a given profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeProfile {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DnsConfig {
    pub listen_addr: String,
    /// Host name to IP overrides
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    /// Zone to nameservers overrides
    #[serde(default)]
    pub zones: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageRequirement {
    pub path: String,
    #[serde(default)]
    pub will_be_created: bool,
    /// Accepted filesystem types, any when empty
    #[serde(default)]
    pub filesystems: Vec<String>,
    #[serde(default)]
    pub min_free_bytes: u64,
    #[serde(default)]
    pub min_bytes_per_second: u64,
}

/// Phase-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PhaseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_user: Option<ServiceUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageRequirement>,
}

impl PhaseData {
    pub fn for_server(server: Server) -> Self {
        Self {
            server: Some(server),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase {
    /// Path-like identifier, e.g. `/nodes/node-1`
    pub id: String,
    pub description: String,
    pub kind: PhaseKind,
    #[serde(default)]
    pub data: PhaseData,
    /// Phase ids or id prefixes this phase depends on
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Phase {
    pub fn new(id: impl Into<String>, description: impl Into<String>, kind: PhaseKind) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind,
            data: PhaseData::default(),
            requires: Vec::new(),
            state: PhaseState::default(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: PhaseData) -> Self {
        self.data = data;
        self
    }

    pub fn requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(requires.into_iter().map(Into::into));
        self
    }

    pub fn server(&self) -> Option<&Server> {
        self.data.server.as_ref()
    }

    /// Whether `id` names this phase or a group containing it.
    pub fn is_under(&self, id: &str) -> bool {
        let prefix = id.trim_end_matches('/');
        self.id == prefix
            || (self.id.starts_with(prefix) && self.id[prefix.len()..].starts_with('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClusterRole;

    #[test]
    fn test_phase_creation() {
        let phase = Phase::new("/wait", "Wait for the control plane", PhaseKind::Wait);

        assert_eq!(phase.id, "/wait");
        assert_eq!(phase.state, PhaseState::Unstarted);
        assert!(phase.requires.is_empty());
        assert!(phase.error.is_none());
        assert!(phase.server().is_none());
    }

    #[test]
    fn test_phase_state_serialization() {
        assert_eq!(PhaseState::Unstarted.as_str(), "unstarted");
        assert_eq!(PhaseState::InProgress.as_str(), "in_progress");
        assert_eq!(PhaseState::RolledBack.as_str(), "rolled_back");
        assert_eq!(
            serde_json::to_string(&PhaseState::RolledBack).unwrap(),
            "\"rolled_back\""
        );
    }

    #[test]
    fn test_phase_state_parsing() {
        assert_eq!(PhaseState::parse("completed"), Some(PhaseState::Completed));
        assert_eq!(PhaseState::parse("in_progress"), Some(PhaseState::InProgress));
        assert_eq!(PhaseState::parse("invalid"), None);
    }

    #[test]
    fn test_phase_kind_parsing() {
        for kind in PhaseKind::ALL {
            assert_eq!(PhaseKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PhaseKind::parse("terraform"), None);
    }

    #[test]
    fn test_is_under() {
        let phase = Phase::new("/nodes/node-1", "Label node-1", PhaseKind::Nodes);
        assert!(phase.is_under("/nodes"));
        assert!(phase.is_under("/nodes/"));
        assert!(phase.is_under("/nodes/node-1"));
        assert!(!phase.is_under("/nodes/node-10"));
        assert!(!phase.is_under("/node"));
    }

    #[test]
    fn test_phase_data_skips_empty_fields() {
        let server = Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master);
        let json = serde_json::to_string(&PhaseData::for_server(server)).unwrap();
        assert!(json.contains("node-1"));
        assert!(!json.contains("labels"));
        assert!(!json.contains("package"));
    }
}

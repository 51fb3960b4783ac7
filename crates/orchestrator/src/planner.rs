//! Builds install and upgrade plans.

use installer_core::{
    DnsConfig, Locator, OperationKey, OperationKind, Phase, PhaseData, PhaseKind, Plan, Server,
    ServiceUser, StorageRequirement,
};

use crate::error::{OrchestratorError, Result};

/// Inputs of a new operation.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub key: OperationKey,
    pub kind: OperationKind,
    pub servers: Vec<Server>,
    pub package: Locator,
    pub service_user: ServiceUser,
    /// User supplied Kubernetes resources
    pub resources: Option<Vec<u8>>,
    pub dns: Option<DnsConfig>,
    pub storage: Option<StorageRequirement>,
}

/// Lays out the phases of an operation:
///
/// ```text
/// /checks -> /dns -> /wait -> /nodes/<hostname>... ----------------> /app
///                          \-> /rbac -> /resources (when given) --/
/// ```
///
/// Upgrades skip the checks, DNS and user resources.
pub struct InstallPlanner;

impl InstallPlanner {
    pub fn plan(req: PlanRequest) -> Result<Plan> {
        let master = req.servers.iter().find(|s| s.is_master()).cloned().ok_or_else(|| {
            OrchestratorError::BadParameter("at least one master server is required".to_string())
        })?;
        let install = req.kind == OperationKind::Install;
        let on_master = || PhaseData::for_server(master.clone());

        let mut phases = Vec::new();
        let mut previous: Option<&'static str> = None;

        if let (true, Some(storage)) = (install, req.storage.clone()) {
            phases.push(
                Phase::new("/checks", "Verify storage requirements", PhaseKind::Checks).with_data(
                    PhaseData {
                        storage: Some(storage),
                        ..Default::default()
                    },
                ),
            );
            previous = Some("/checks");
        }

        if let (true, Some(dns)) = (install, req.dns.clone()) {
            phases.push(
                Phase::new("/dns", "Configure DNS overrides", PhaseKind::Dns)
                    .with_data(PhaseData {
                        dns: Some(dns),
                        ..on_master()
                    })
                    .requires(previous),
            );
            previous = Some("/dns");
        }

        phases.push(
            Phase::new("/wait", "Wait for the control plane to start", PhaseKind::Wait)
                .with_data(on_master())
                .requires(previous),
        );

        for server in &req.servers {
            phases.push(
                Phase::new(
                    format!("/nodes/{}", server.hostname),
                    format!("Update labels and taints of {server}"),
                    PhaseKind::Nodes,
                )
                .with_data(PhaseData {
                    package: Some(req.package.clone()),
                    ..PhaseData::for_server(server.clone())
                })
                .requires(["/wait"]),
            );
        }

        phases.push(
            Phase::new("/rbac", "Create bootstrap RBAC resources", PhaseKind::Rbac)
                .with_data(PhaseData {
                    package: Some(req.package.clone()),
                    ..on_master()
                })
                .requires(["/wait"]),
        );

        let mut app_requires = vec!["/nodes", "/rbac"];
        let resources = req.resources.filter(|bytes| !bytes.is_empty());
        if let (true, Some(resources)) = (install, resources) {
            phases.push(
                Phase::new("/resources", "Create user-supplied resources", PhaseKind::Resources)
                    .with_data(PhaseData {
                        resources: Some(resources),
                        ..on_master()
                    })
                    .requires(["/rbac"]),
            );
            app_requires.push("/resources");
        }

        let description = if install {
            "Install the application"
        } else {
            "Update the application"
        };
        phases.push(
            Phase::new("/app", description, PhaseKind::App)
                .with_data(PhaseData {
                    package: Some(req.package.clone()),
                    service_user: Some(req.service_user.clone()),
                    ..on_master()
                })
                .requires(app_requires),
        );

        Ok(Plan::new(req.key, req.kind, req.servers, phases)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_core::ClusterRole;

    fn request(kind: OperationKind) -> PlanRequest {
        PlanRequest {
            key: OperationKey::new("prod"),
            kind,
            servers: vec![
                Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master),
                Server::new("node-2", "10.0.0.2", "worker", ClusterRole::Node),
            ],
            package: Locator::new("gravitational.io", "telekube", "5.2.1"),
            service_user: ServiceUser::new("planet", 1000, 1000),
            resources: Some(b"kind: Namespace\n".to_vec()),
            dns: Some(DnsConfig {
                listen_addr: "127.0.0.2".into(),
                ..Default::default()
            }),
            storage: Some(StorageRequirement {
                path: "/var/lib/gravity".into(),
                ..Default::default()
            }),
        }
    }

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.phases().iter().map(|phase| phase.id.as_str()).collect()
    }

    #[test]
    fn test_install_plan_layout() {
        let plan = InstallPlanner::plan(request(OperationKind::Install)).unwrap();
        assert_eq!(
            ids(&plan),
            vec![
                "/checks",
                "/dns",
                "/wait",
                "/nodes/node-1",
                "/nodes/node-2",
                "/rbac",
                "/resources",
                "/app"
            ]
        );

        let app_deps: Vec<&str> = plan
            .dependencies("/app")
            .unwrap()
            .into_iter()
            .map(|phase| phase.id.as_str())
            .collect();
        assert_eq!(app_deps, vec!["/nodes/node-1", "/nodes/node-2", "/rbac", "/resources"]);

        // node phases run in parallel once the control plane is up
        let mut plan = plan;
        for id in ["/checks", "/dns", "/wait"] {
            plan.transition(id, installer_core::PhaseState::InProgress, None).unwrap();
            plan.transition(id, installer_core::PhaseState::Completed, None).unwrap();
        }
        let frontier: Vec<&str> = plan.frontier().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(frontier, vec!["/nodes/node-1", "/nodes/node-2", "/rbac"]);
    }

    #[test]
    fn test_master_only_phases_target_master() {
        let plan = InstallPlanner::plan(request(OperationKind::Install)).unwrap();
        for id in ["/dns", "/wait", "/rbac", "/resources", "/app"] {
            assert!(plan.phase(id).unwrap().server().unwrap().is_master(), "{id}");
        }
        assert!(plan.phase("/checks").unwrap().server().is_none());
    }

    #[test]
    fn test_upgrade_plan_skips_install_only_phases() {
        let plan = InstallPlanner::plan(request(OperationKind::Upgrade)).unwrap();
        assert_eq!(
            ids(&plan),
            vec!["/wait", "/nodes/node-1", "/nodes/node-2", "/rbac", "/app"]
        );
        assert_eq!(plan.phase("/app").unwrap().description, "Update the application");
    }

    #[test]
    fn test_requires_master() {
        let mut req = request(OperationKind::Install);
        req.servers.retain(|server| !server.is_master());
        assert!(matches!(
            InstallPlanner::plan(req).unwrap_err(),
            OrchestratorError::BadParameter(_)
        ));
    }
}

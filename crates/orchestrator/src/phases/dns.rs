//! DNS overrides for the cluster resolver.

use async_trait::async_trait;
use installer_core::{DnsConfig, PhaseKind, Server};
use serde_json::json;
use std::sync::Arc;

use crate::core::{check_master_server, ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;
use crate::services::{KubeClient, Services};

pub const OVERRIDES_NAMESPACE: &str = "kube-system";
pub const OVERRIDES_CONFIG_MAP: &str = "cluster-dns-overrides";

/// Render the overrides ConfigMap.
///
/// Hosts are rendered one `<host> <ip>` pair per line, zones one
/// `<zone> <nameserver>...` entry per line.
pub fn overrides_manifest(dns: &DnsConfig) -> Result<Vec<u8>> {
    let hosts: Vec<String> = dns
        .hosts
        .iter()
        .map(|(host, ip)| format!("{host} {ip}"))
        .collect();
    let zones: Vec<String> = dns
        .zones
        .iter()
        .map(|(zone, servers)| format!("{zone} {}", servers.join(" ")))
        .collect();

    let manifest = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": OVERRIDES_CONFIG_MAP,
            "namespace": OVERRIDES_NAMESPACE,
        },
        "data": {
            "listen-addr": dns.listen_addr,
            "hosts": hosts.join("\n"),
            "zones": zones.join("\n"),
        },
    });
    Ok(serde_json::to_vec_pretty(&manifest)?)
}

pub struct DnsExecutor {
    dns: DnsConfig,
    server: Option<Server>,
    servers: Vec<Server>,
    kube: Arc<dyn KubeClient>,
    progress: ProgressReporter,
}

impl DnsExecutor {
    pub fn new(params: ExecutorParams, services: &Services) -> Result<Self> {
        let dns = params.phase.data.dns.clone().ok_or_else(|| {
            OrchestratorError::BadParameter(format!(
                "phase {} requires a DNS configuration",
                params.phase.id
            ))
        })?;
        Ok(Self {
            dns,
            server: params.server().cloned(),
            servers: params.servers,
            kube: Arc::clone(&services.kube),
            progress: params.progress,
        })
    }
}

#[async_trait]
impl PhaseExecutor for DnsExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Dns
    }

    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        check_master_server(self.server.as_ref(), &self.servers)
    }

    async fn execute(&self, _ctx: &ExecContext) -> Result<()> {
        self.progress.next_step(format!(
            "Configuring DNS overrides ({} hosts, {} zones)",
            self.dns.hosts.len(),
            self.dns.zones.len()
        ));
        self.kube.apply(&overrides_manifest(&self.dns)?).await
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        self.progress.next_step("Removing DNS overrides");
        let empty = DnsConfig {
            listen_addr: self.dns.listen_addr.clone(),
            ..Default::default()
        };
        self.kube.apply(&overrides_manifest(&empty)?).await
    }
}

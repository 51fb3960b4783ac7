//! Installer configuration: command line flags merged with an optional TOML
//! file, validated and completed with defaults.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, ValueEnum};
use installer_core::{ClusterRole, DnsConfig, Locator, Server, ServiceUser, StorageRequirement};
use orchestrator::services::LocalApplications;
use orchestrator::FailurePolicy;
use rand::RngCore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_VXLAN_PORT: u16 = 8472;
pub const DEFAULT_DNS_LISTEN_ADDR: &str = "127.0.0.2";
pub const DEFAULT_SERVICE_USER: &str = "planet";
pub const DEFAULT_SERVICE_UID: u32 = 1000;
pub const DEFAULT_SERVICE_GID: u32 = 1000;
pub const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
pub const DEFAULT_SERVICE_CIDR: &str = "10.100.0.0/16";
pub const DEFAULT_ROLE: &str = "master";

/// Bytes of randomness in a generated install token.
const TOKEN_BYTES: usize = 6;

/// Any routable address works, nothing is sent to it.
const ROUTE_PROBE_ADDR: &str = "10.255.255.255:1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    /// Run the whole plan
    #[default]
    Automatic,
    /// Run the whole plan with a live progress display
    Interactive,
    /// Create the plan and let the operator execute phases one by one
    Manual,
}

fn parse_failure_policy(s: &str) -> std::result::Result<FailurePolicy, String> {
    FailurePolicy::parse(s).ok_or_else(|| format!("unknown failure policy {s:?}, use stop or continue"))
}

/// Flags shared by every command that runs phases.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Directory with the installer's application data [default: current directory]
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Directory for generated files [default: a new temporary directory]
    #[arg(long)]
    pub write_state_dir: Option<PathBuf>,

    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Automatic)]
    pub mode: Mode,

    /// Maximum number of phases running at once
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// What to do with independent phases after a failure: stop or continue
    #[arg(long, default_value = "stop", value_parser = parse_failure_policy)]
    pub failure_policy: FailurePolicy,
}

impl EngineArgs {
    pub fn state_dir(&self) -> Result<&Path> {
        self.state_dir
            .as_deref()
            .ok_or_else(|| anyhow!("state directory is not set"))
    }

    pub fn write_state_dir(&self) -> Result<&Path> {
        self.write_state_dir
            .as_deref()
            .ok_or_else(|| anyhow!("write state directory is not set"))
    }

    /// Default the state directories and verify the read one.
    pub fn resolve(&mut self) -> Result<()> {
        let state_dir = match self.state_dir.take() {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to determine the current directory")?,
        };
        let metadata = std::fs::metadata(&state_dir)
            .with_context(|| format!("state directory {} is not accessible", state_dir.display()))?;
        if !metadata.is_dir() {
            bail!("state directory {} is not a directory", state_dir.display());
        }
        self.state_dir = Some(state_dir);

        let write_state_dir = match self.write_state_dir.take() {
            Some(dir) => dir,
            None => std::env::temp_dir().join(format!("cluster-installer-{}", uuid::Uuid::new_v4())),
        };
        std::fs::create_dir_all(&write_state_dir).with_context(|| {
            format!("failed to create write state directory {}", write_state_dir.display())
        })?;
        self.write_state_dir = Some(write_state_dir);
        if self.max_parallel == 0 {
            bail!("--max-parallel must be at least 1");
        }
        Ok(())
    }
}

/// Storage requirement of the installer node.
#[derive(Debug, Clone, Default, Args)]
pub struct StorageArgs {
    /// Volume to verify before installing
    #[arg(long = "storage-path")]
    pub path: Option<PathBuf>,

    /// The volume does not exist yet, check its closest existing parent
    #[arg(long = "storage-will-be-created")]
    pub will_be_created: bool,

    /// Accepted filesystem types, comma separated
    #[arg(long = "storage-fs", value_delimiter = ',')]
    pub filesystems: Vec<String>,

    /// Minimum free space in bytes
    #[arg(long = "storage-min-free", default_value_t = 0)]
    pub min_free_bytes: u64,

    /// Minimum sequential write speed in bytes per second
    #[arg(long = "storage-min-speed", default_value_t = 0)]
    pub min_bytes_per_second: u64,
}

impl StorageArgs {
    pub fn requirement(&self) -> Option<StorageRequirement> {
        let path = self.path.as_ref()?;
        Some(StorageRequirement {
            path: path.display().to_string(),
            will_be_created: self.will_be_created,
            filesystems: self.filesystems.clone(),
            min_free_bytes: self.min_free_bytes,
            min_bytes_per_second: self.min_bytes_per_second,
        })
    }
}

/// Server entry of the configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub hostname: String,
    pub advertise_ip: String,
    /// Node profile of the server
    pub role: String,
    #[serde(default)]
    pub cluster_role: ClusterRole,
}

impl From<ServerEntry> for Server {
    fn from(entry: ServerEntry) -> Self {
        Server::new(entry.hostname, entry.advertise_ip, entry.role, entry.cluster_role)
    }
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub cluster: Option<String>,
    pub app: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl FileConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Flags of the `install` and `upgrade` commands.
#[derive(Debug, Clone, Args)]
pub struct InstallConfig {
    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// TOML file with the cluster name, app package and server inventory
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cluster name [default: generated]
    #[arg(long)]
    pub cluster: Option<String>,

    /// Address this node advertises to the cluster [default: picked among the host interfaces]
    #[arg(long)]
    pub advertise_addr: Option<String>,

    /// Node profile of this server
    #[arg(long)]
    pub role: Option<String>,

    /// Application package as repository/name:version [default: found in the state directory]
    #[arg(long)]
    pub app: Option<String>,

    /// Kubernetes resources to create after the bootstrap resources
    #[arg(long)]
    pub resources: Option<PathBuf>,

    /// Resolve a host to an address, as host/ip
    #[arg(long = "dns-host")]
    pub dns_hosts: Vec<String>,

    /// Forward a zone to a nameserver, as zone/nameserver
    #[arg(long = "dns-zone")]
    pub dns_zones: Vec<String>,

    #[arg(long)]
    pub dns_listen_addr: Option<String>,

    #[arg(long, default_value = DEFAULT_POD_CIDR)]
    pub pod_cidr: String,

    #[arg(long, default_value = DEFAULT_SERVICE_CIDR)]
    pub service_cidr: String,

    #[arg(long)]
    pub vxlan_port: Option<u16>,

    #[arg(long)]
    pub service_uid: Option<u32>,

    #[arg(long)]
    pub service_gid: Option<u32>,

    /// Token joining nodes authenticate with [default: generated]
    #[arg(long)]
    pub token: Option<String>,

    /// Resolved server inventory
    #[arg(skip)]
    pub servers: Vec<Server>,
}

impl InstallConfig {
    /// Merge the configuration file, validate the flags and fill in every
    /// value left unset.
    pub async fn check_and_set_defaults(&mut self) -> Result<()> {
        self.engine.resolve()?;

        let file = match &self.config {
            Some(path) => FileConfig::load(path).await?,
            None => FileConfig::default(),
        };

        if self.cluster.is_none() {
            self.cluster = Some(match file.cluster {
                Some(cluster) => cluster,
                None => format!("cluster-{}", random_hex(3)),
            });
        }
        if self.app.is_none() {
            self.app = file.app;
        }
        if self.token.is_none() {
            self.token = Some(random_hex(TOKEN_BYTES));
        }
        let vxlan_port = *self.vxlan_port.get_or_insert(DEFAULT_VXLAN_PORT);
        if vxlan_port == 0 {
            bail!("--vxlan-port must not be 0");
        }
        if self.dns_listen_addr.is_none() {
            self.dns_listen_addr = Some(DEFAULT_DNS_LISTEN_ADDR.to_string());
        }
        self.service_uid.get_or_insert(DEFAULT_SERVICE_UID);
        self.service_gid.get_or_insert(DEFAULT_SERVICE_GID);

        let pod = Cidr::parse(&self.pod_cidr).context("invalid --pod-cidr")?;
        let service = Cidr::parse(&self.service_cidr).context("invalid --service-cidr")?;
        if pod.overlaps(&service) {
            bail!(
                "pod network {} overlaps with service network {}",
                self.pod_cidr,
                self.service_cidr
            );
        }
        self.dns_config()?;

        self.servers = if file.servers.is_empty() {
            vec![self.local_server().await?]
        } else {
            file.servers.into_iter().map(Server::from).collect()
        };
        if !self.servers.iter().any(Server::is_master) {
            bail!("the server inventory has no master");
        }

        info!(
            cluster = self.cluster.as_deref().unwrap_or_default(),
            servers = self.servers.len(),
            pod_cidr = %self.pod_cidr,
            service_cidr = %self.service_cidr,
            vxlan_port,
            "Configuration resolved"
        );
        Ok(())
    }

    pub fn cluster(&self) -> &str {
        self.cluster.as_deref().unwrap_or_default()
    }

    pub fn service_user(&self) -> ServiceUser {
        ServiceUser::new(
            DEFAULT_SERVICE_USER,
            self.service_uid.unwrap_or(DEFAULT_SERVICE_UID),
            self.service_gid.unwrap_or(DEFAULT_SERVICE_GID),
        )
    }

    /// DNS overrides, `None` when no override was given.
    pub fn dns_config(&self) -> Result<Option<DnsConfig>> {
        if self.dns_hosts.is_empty() && self.dns_zones.is_empty() {
            return Ok(None);
        }
        Ok(Some(DnsConfig {
            listen_addr: self
                .dns_listen_addr
                .clone()
                .unwrap_or_else(|| DEFAULT_DNS_LISTEN_ADDR.to_string()),
            hosts: parse_dns_hosts(&self.dns_hosts)?,
            zones: parse_dns_zones(&self.dns_zones)?,
        }))
    }

    pub async fn resources(&self) -> Result<Option<Vec<u8>>> {
        let Some(path) = &self.resources else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read resources {}", path.display()))?;
        Ok(Some(bytes))
    }

    /// The `--app` package, or the one application in the state directory.
    pub async fn package(&self) -> Result<Locator> {
        if let Some(app) = &self.app {
            return Ok(Locator::parse(app)?);
        }
        let state_dir = self.engine.state_dir()?;
        let mut packages = LocalApplications::new(state_dir).list().await?;
        match packages.len() {
            0 => bail!(
                "state directory {} has no application data, run the installer from its unpacked directory or pass --app",
                state_dir.display()
            ),
            1 => Ok(packages.remove(0)),
            _ => bail!(
                "state directory {} holds several applications, pick one with --app",
                state_dir.display()
            ),
        }
    }

    async fn local_server(&self) -> Result<Server> {
        let hostname = sysinfo::System::host_name()
            .ok_or_else(|| anyhow!("failed to determine the hostname of this server"))?;
        let advertise_ip = match &self.advertise_addr {
            Some(addr) => {
                addr.parse::<IpAddr>()
                    .with_context(|| format!("invalid --advertise-addr {addr:?}"))?;
                addr.clone()
            }
            None => pick_advertise_addr()
                .await
                .context("failed to pick an advertise address, pass --advertise-addr")?
                .to_string(),
        };
        debug!(%hostname, %advertise_ip, "Local server");
        Ok(Server::new(
            hostname,
            advertise_ip,
            self.role.as_deref().unwrap_or(DEFAULT_ROLE),
            ClusterRole::Master,
        ))
    }
}

/// Address of the interface holding the default route.
async fn pick_advertise_addr() -> Result<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(ROUTE_PROBE_ADDR).await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        bail!("no usable interface address");
    }
    Ok(ip)
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn split_override<'a>(value: &'a str, form: &str) -> Result<(&'a str, IpAddr)> {
    let (name, addr) = value
        .split_once('/')
        .filter(|(name, addr)| !name.is_empty() && !addr.is_empty())
        .ok_or_else(|| anyhow!("invalid DNS override {value:?}, expected {form}"))?;
    let addr = addr
        .parse()
        .with_context(|| format!("invalid address in DNS override {value:?}"))?;
    Ok((name, addr))
}

/// Parse `host/ip` overrides.
pub fn parse_dns_hosts(values: &[String]) -> Result<BTreeMap<String, String>> {
    let mut hosts = BTreeMap::new();
    for value in values {
        let (host, addr) = split_override(value, "host/ip")?;
        if hosts.insert(host.to_string(), addr.to_string()).is_some() {
            bail!("host {host} is overridden more than once");
        }
    }
    Ok(hosts)
}

/// Parse `zone/nameserver` overrides. A zone may be given several times.
pub fn parse_dns_zones(values: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut zones: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for value in values {
        let (zone, addr) = split_override(value, "zone/nameserver")?;
        zones.entry(zone.to_string()).or_default().push(addr.to_string());
    }
    Ok(zones)
}

/// IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("{s:?} is not in CIDR notation"))?;
        let addr: Ipv4Addr = addr.parse().with_context(|| format!("invalid address in {s:?}"))?;
        let prefix: u8 = prefix.parse().with_context(|| format!("invalid prefix in {s:?}"))?;
        if prefix > 32 {
            bail!("prefix of {s:?} is longer than 32 bits");
        }
        Ok(Self { addr, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        let mask = Self::mask(self.prefix.min(other.prefix));
        u32::from(self.addr) & mask == u32::from(other.addr) & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(state_dir: &Path) -> EngineArgs {
        EngineArgs {
            state_dir: Some(state_dir.to_path_buf()),
            write_state_dir: None,
            kubeconfig: None,
            mode: Mode::Automatic,
            max_parallel: 4,
            failure_policy: FailurePolicy::Stop,
        }
    }

    fn config(state_dir: &Path) -> InstallConfig {
        InstallConfig {
            engine: engine(state_dir),
            storage: StorageArgs::default(),
            config: None,
            cluster: None,
            advertise_addr: Some("10.0.0.1".into()),
            role: None,
            app: Some("gravitational.io/telekube:5.2.1".into()),
            resources: None,
            dns_hosts: vec![],
            dns_zones: vec![],
            dns_listen_addr: None,
            pod_cidr: DEFAULT_POD_CIDR.into(),
            service_cidr: DEFAULT_SERVICE_CIDR.into(),
            vxlan_port: None,
            service_uid: None,
            service_gid: None,
            token: None,
            servers: vec![],
        }
    }

    #[test]
    fn test_parse_dns_overrides() {
        let hosts = parse_dns_hosts(&["registry.local/10.0.0.5".into()]).unwrap();
        assert_eq!(hosts["registry.local"], "10.0.0.5");

        let zones = parse_dns_zones(&[
            "corp.example/10.0.0.53".into(),
            "corp.example/10.0.1.53".into(),
            "lab.example/192.168.1.1".into(),
        ])
        .unwrap();
        assert_eq!(zones["corp.example"], vec!["10.0.0.53", "10.0.1.53"]);
        assert_eq!(zones.len(), 2);
    }

    #[test]
    fn test_parse_dns_overrides_rejects_bad_input() {
        assert!(parse_dns_hosts(&["registry.local".into()]).is_err());
        assert!(parse_dns_hosts(&["/10.0.0.5".into()]).is_err());
        assert!(parse_dns_hosts(&["registry.local/not-an-ip".into()]).is_err());
        assert!(parse_dns_hosts(&["a/10.0.0.1".into(), "a/10.0.0.2".into()]).is_err());
        assert!(parse_dns_zones(&["corp.example/".into()]).is_err());
    }

    #[test]
    fn test_cidr_overlap() {
        let pods = Cidr::parse("10.244.0.0/16").unwrap();
        let services = Cidr::parse("10.100.0.0/16").unwrap();
        assert!(!pods.overlaps(&services));
        assert!(pods.overlaps(&Cidr::parse("10.244.8.0/24").unwrap()));
        assert!(Cidr::parse("0.0.0.0/0").unwrap().overlaps(&services));
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("10.0.0.0").is_err());
    }

    #[tokio::test]
    async fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.check_and_set_defaults().await.unwrap();

        assert_eq!(config.vxlan_port, Some(DEFAULT_VXLAN_PORT));
        assert_eq!(config.dns_listen_addr.as_deref(), Some(DEFAULT_DNS_LISTEN_ADDR));
        assert_eq!(config.service_user(), ServiceUser::new("planet", 1000, 1000));
        assert_eq!(config.token.as_ref().unwrap().len(), 2 * TOKEN_BYTES);
        assert!(config.cluster().starts_with("cluster-"));
        assert!(config.engine.write_state_dir().unwrap().is_dir());
        assert!(config.dns_config().unwrap().is_none());

        let [server] = config.servers.as_slice() else {
            panic!("expected the local server only");
        };
        assert_eq!(server.advertise_ip, "10.0.0.1");
        assert_eq!(server.role, DEFAULT_ROLE);
        assert!(server.is_master());
    }

    #[tokio::test]
    async fn test_file_supplies_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            r#"
cluster = "prod"

[[servers]]
hostname = "node-1"
advertise_ip = "10.0.0.1"
role = "master"
cluster_role = "master"

[[servers]]
hostname = "node-2"
advertise_ip = "10.0.0.2"
role = "worker"
"#,
        )
        .unwrap();

        let mut config = config(dir.path());
        config.config = Some(path);
        config.dns_zones = vec!["corp.example/10.0.0.53".into()];
        config.check_and_set_defaults().await.unwrap();

        assert_eq!(config.cluster(), "prod");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].cluster_role, ClusterRole::Node);
        let dns = config.dns_config().unwrap().unwrap();
        assert_eq!(dns.listen_addr, DEFAULT_DNS_LISTEN_ADDR);
        assert_eq!(dns.zones["corp.example"], vec!["10.0.0.53"]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();

        let mut overlapping = config(dir.path());
        overlapping.service_cidr = "10.244.128.0/20".into();
        assert!(overlapping.check_and_set_defaults().await.is_err());

        let mut missing = config(&dir.path().join("missing"));
        assert!(missing.check_and_set_defaults().await.is_err());

        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        let mut not_a_dir = config(&file);
        assert!(not_a_dir.check_and_set_defaults().await.is_err());
    }

    #[tokio::test]
    async fn test_package_from_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.app = None;
        config.check_and_set_defaults().await.unwrap();

        let err = config.package().await.unwrap_err();
        assert!(err.to_string().contains("has no application data"));

        let app_dir = dir.path().join("gravitational.io/telekube/5.2.1");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("app.json"), r#"{"name":"telekube","version":"5.2.1"}"#).unwrap();
        assert_eq!(
            config.package().await.unwrap(),
            Locator::new("gravitational.io", "telekube", "5.2.1")
        );
    }
}

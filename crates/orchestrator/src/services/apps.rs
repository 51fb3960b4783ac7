//! Local application packages and their lifecycle hooks.

use async_trait::async_trait;
use installer_core::{Locator, NodeProfile, ServiceUser};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::log_pipe::read_line_lossy;

const MANIFEST_FILE: &str = "app.json";
const RESOURCES_FILE: &str = "resources/resources.yaml";
const HOOKS_DIR: &str = "hooks";

/// Application manifest stored next to the package contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub node_profiles: Vec<NodeProfile>,
}

impl Manifest {
    pub fn node_profile(&self, name: &str) -> Result<&NodeProfile> {
        self.node_profiles
            .iter()
            .find(|profile| profile.name == name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node profile {name:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub locator: Locator,
    pub manifest: Manifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    Install,
    Installed,
    Update,
    Updated,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Installed => "installed",
            Self::Update => "update",
            Self::Updated => "updated",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRequest {
    pub application: Locator,
    pub hook: HookType,
    pub service_user: ServiceUser,
}

pub type HookWriter<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

#[async_trait]
pub trait Applications: Send + Sync {
    async fn get_app(&self, locator: &Locator) -> Result<Application>;

    /// Bootstrap Kubernetes resources shipped with the package.
    async fn get_app_resources(&self, locator: &Locator) -> Result<Vec<u8>>;

    /// Fails with `NotFound` when the package has no such hook.
    async fn check_has_app_hook(&self, req: &HookRequest) -> Result<()>;

    /// Run the hook, writing its output to `writer` as it is produced.
    async fn stream_app_hook(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
        writer: HookWriter<'_>,
    ) -> Result<()>;
}

/// Packages unpacked on the local disk as
/// `<root>/<repository>/<name>/<version>/`.
#[derive(Debug, Clone)]
pub struct LocalApplications {
    root: PathBuf,
}

impl LocalApplications {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn app_dir(&self, locator: &Locator) -> PathBuf {
        self.root
            .join(&locator.repository)
            .join(&locator.name)
            .join(&locator.version)
    }

    fn hook_path(&self, req: &HookRequest) -> PathBuf {
        self.app_dir(&req.application)
            .join(HOOKS_DIR)
            .join(req.hook.as_str())
    }

    /// Every package with a manifest under the root.
    pub async fn list(&self) -> Result<Vec<Locator>> {
        let mut locators = Vec::new();
        for repository in read_dirs(&self.root).await? {
            for name in read_dirs(&repository).await? {
                for version in read_dirs(&name).await? {
                    if !tokio::fs::try_exists(version.join(MANIFEST_FILE)).await? {
                        continue;
                    }
                    locators.push(Locator::new(
                        file_name(&repository),
                        file_name(&name),
                        file_name(&version),
                    ));
                }
            }
        }
        locators.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        Ok(locators)
    }
}

async fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn read_package_file(path: &Path, locator: &Locator) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
            OrchestratorError::NotFound(format!("{} in package {locator}", path.display())),
        ),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Applications for LocalApplications {
    async fn get_app(&self, locator: &Locator) -> Result<Application> {
        let path = self.app_dir(locator).join(MANIFEST_FILE);
        let bytes = read_package_file(&path, locator).await?;
        let manifest = serde_json::from_slice(&bytes)?;
        Ok(Application {
            locator: locator.clone(),
            manifest,
        })
    }

    async fn get_app_resources(&self, locator: &Locator) -> Result<Vec<u8>> {
        read_package_file(&self.app_dir(locator).join(RESOURCES_FILE), locator).await
    }

    async fn check_has_app_hook(&self, req: &HookRequest) -> Result<()> {
        match tokio::fs::metadata(self.hook_path(req)).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(OrchestratorError::NotFound(format!(
                "{} hook of {}",
                req.hook, req.application
            ))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                OrchestratorError::NotFound(format!("{} hook of {}", req.hook, req.application)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn stream_app_hook(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
        writer: HookWriter<'_>,
    ) -> Result<()> {
        let path = self.hook_path(req);
        debug!(hook = %req.hook, app = %req.application, path = %path.display(), "Running hook");

        let mut child = Command::new(&path)
            .current_dir(self.app_dir(&req.application))
            .env("APP_PACKAGE", req.application.to_string())
            .env("SERVICE_USER", &req.service_user.name)
            .env("SERVICE_UID", req.service_user.uid.to_string())
            .env("SERVICE_GID", req.service_user.gid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            OrchestratorError::ExecutionFailed("hook stdout not captured".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            OrchestratorError::ExecutionFailed("hook stderr not captured".to_string())
        })?;
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
        let (mut stdout_open, mut stderr_open) = (true, true);

        while stdout_open || stderr_open {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(hook = %req.hook, error = %err, "Failed to kill hook");
                    }
                    return Err(OrchestratorError::Cancelled(format!("{} hook", req.hook)));
                }
                line = read_line_lossy(&mut stdout, &mut stdout_buf), if stdout_open => {
                    line?.or_else(|| { stdout_open = false; None })
                }
                line = read_line_lossy(&mut stderr, &mut stderr_buf), if stderr_open => {
                    line?.or_else(|| { stderr_open = false; None })
                }
            };
            if let Some(line) = line {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(OrchestratorError::ExecutionFailed(format!(
                "{} {} hook exited with {status}",
                req.application, req.hook
            )));
        }
        Ok(())
    }
}

/// Scripted output of a hook registered with [`InMemoryApplications`].
#[derive(Debug, Clone, Default)]
struct HookScript {
    output: Vec<String>,
    failure: Option<String>,
}

/// Packages held in memory, with scripted hooks.
#[derive(Debug, Default)]
pub struct InMemoryApplications {
    apps: HashMap<Locator, Application>,
    resources: HashMap<Locator, Vec<u8>>,
    hooks: HashMap<(Locator, HookType), HookScript>,
    runs: Mutex<Vec<HookType>>,
}

impl InMemoryApplications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, locator: Locator, manifest: Manifest) -> Self {
        self.apps.insert(
            locator.clone(),
            Application { locator, manifest },
        );
        self
    }

    pub fn with_resources(mut self, locator: Locator, resources: impl Into<Vec<u8>>) -> Self {
        self.resources.insert(locator, resources.into());
        self
    }

    pub fn with_hook<I, S>(mut self, locator: Locator, hook: HookType, output: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hooks.insert(
            (locator, hook),
            HookScript {
                output: output.into_iter().map(Into::into).collect(),
                failure: None,
            },
        );
        self
    }

    pub fn with_failing_hook(mut self, locator: Locator, hook: HookType, error: &str) -> Self {
        self.hooks.insert(
            (locator, hook),
            HookScript {
                output: Vec::new(),
                failure: Some(error.to_string()),
            },
        );
        self
    }

    /// Hooks that were run, in order.
    pub fn runs(&self) -> Vec<HookType> {
        self.runs.lock().map(|runs| runs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Applications for InMemoryApplications {
    async fn get_app(&self, locator: &Locator) -> Result<Application> {
        self.apps
            .get(locator)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("application {locator}")))
    }

    async fn get_app_resources(&self, locator: &Locator) -> Result<Vec<u8>> {
        self.resources
            .get(locator)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("resources of {locator}")))
    }

    async fn check_has_app_hook(&self, req: &HookRequest) -> Result<()> {
        if self
            .hooks
            .contains_key(&(req.application.clone(), req.hook))
        {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(format!(
                "{} hook of {}",
                req.hook, req.application
            )))
        }
    }

    async fn stream_app_hook(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
        writer: HookWriter<'_>,
    ) -> Result<()> {
        let script = self
            .hooks
            .get(&(req.application.clone(), req.hook))
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("{} hook of {}", req.hook, req.application))
            })?;
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(req.hook);
        }

        for line in &script.output {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled(format!("{} hook", req.hook)));
            }
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        match script.failure {
            Some(error) => Err(OrchestratorError::ExecutionFailed(error)),
            None => Ok(()),
        }
    }
}

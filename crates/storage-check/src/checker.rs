use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::os::{Mount, OsInterface, RealOs};
use crate::probe::{human_bytes, Probe, Reporter};

const CHECKER_ID: &str = "io-check";

/// Size of a single write in the throughput probe.
pub const BLOCK_SIZE: usize = 100_000;
/// Number of writes in the throughput probe.
pub const CYCLES: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Volume to check
    pub path: PathBuf,
    /// Check the closest existing parent when `path` does not exist yet
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

pub struct StorageChecker {
    config: StorageConfig,
    os: Arc<dyn OsInterface>,
}

impl StorageChecker {
    pub fn new(config: StorageConfig) -> Self {
        Self::with_os(config, Arc::new(RealOs))
    }

    pub fn with_os(config: StorageConfig, os: Arc<dyn OsInterface>) -> Self {
        Self { config, os }
    }

    pub fn name(&self) -> String {
        format!("{}({})", CHECKER_ID, self.config.path.display())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Run every enabled check and add the probes to `reporter`.
    ///
    /// Errors that prevent a check from running are reported as a failed
    /// probe rather than returned.
    pub async fn check(&self, cancel: &CancellationToken, reporter: &mut dyn Reporter) {
        if let Err(err) = self.run(cancel, reporter).await {
            warn!(checker = %self.name(), error = %err, "Storage check could not complete");
            reporter.add(Probe::failed(
                self.name(),
                format!("failed to validate storage requirements: {err}"),
            ));
        }
    }

    /// Convenience wrapper collecting the probes into a vector.
    pub async fn probes(&self, cancel: &CancellationToken) -> Vec<Probe> {
        let mut probes = Vec::new();
        self.check(cancel, &mut probes).await;
        probes
    }

    async fn run(&self, cancel: &CancellationToken, reporter: &mut dyn Reporter) -> Result<()> {
        let path = self.eval_path().await?;
        debug!(checker = %self.name(), path = %path.display(), "Checking storage");

        // all dimensions run even if one of them errors
        let results = [
            self.check_fs_type(&path, reporter).await,
            self.check_capacity(&path, reporter).await,
            self.check_write_speed(cancel, &path, reporter).await,
        ];
        results.into_iter().collect()
    }

    /// Resolve the directory the checks apply to.
    async fn eval_path(&self) -> Result<PathBuf> {
        let mut path = self.config.path.clone();
        loop {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => return Ok(path),
                Ok(_) => return Err(StorageError::NotADirectory(path)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    if !self.config.will_be_created {
                        return Err(StorageError::NotFound(self.config.path.clone()));
                    }
                    match path.parent() {
                        Some(parent) if parent != path => path = parent.to_path_buf(),
                        _ => return Err(StorageError::NotADirectory(path)),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn check_fs_type(&self, path: &Path, reporter: &mut dyn Reporter) -> Result<()> {
        if self.config.filesystems.is_empty() {
            return Ok(());
        }

        let mount = fs_from_path(path, self.os.mounts().await?).await?;
        if self.config.filesystems.iter().any(|fs| *fs == mount.fs_type) {
            reporter.add(Probe::running(self.name()));
        } else {
            reporter.add(Probe::failed(
                self.name(),
                format!(
                    "path {} requires filesystem [{}], belongs to {} mount point of type {}",
                    self.config.path.display(),
                    self.config.filesystems.join(" "),
                    mount.dir_name.display(),
                    mount.fs_type
                ),
            ));
        }
        Ok(())
    }

    async fn check_capacity(&self, path: &Path, reporter: &mut dyn Reporter) -> Result<()> {
        if self.config.min_free_bytes == 0 {
            return Ok(());
        }

        let available = self.os.disk_capacity(path).await?;
        if available < self.config.min_free_bytes {
            reporter.add(Probe::failed(
                self.name(),
                format!(
                    "{} available space left on {}, minimum of {} required",
                    human_bytes(available),
                    self.config.path.display(),
                    human_bytes(self.config.min_free_bytes)
                ),
            ));
        } else {
            reporter.add(Probe::running(self.name()));
        }
        Ok(())
    }

    async fn check_write_speed(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        if self.config.min_bytes_per_second == 0 {
            return Ok(());
        }

        let bps = self.os.disk_speed(cancel, path, "probe").await?;
        if bps >= self.config.min_bytes_per_second {
            reporter.add(Probe::running(self.name()));
        } else {
            reporter.add(Probe::failed(
                self.name(),
                format!(
                    "min write speed {}/sec required, have {}",
                    human_bytes(self.config.min_bytes_per_second),
                    human_bytes(bps)
                ),
            ));
        }
        Ok(())
    }
}

/// Find the mount holding `path`, preferring the deepest mount point.
async fn fs_from_path(path: &Path, mut mounts: Vec<Mount>) -> Result<Mount> {
    let clean = tokio::fs::canonicalize(path).await?;
    mounts.sort_by(|a, b| {
        b.dir_name
            .components()
            .count()
            .cmp(&a.dir_name.components().count())
    });

    mounts
        .into_iter()
        .find(|mount| clean.starts_with(&mount.dir_name) && mount.fs_type != "rootfs")
        .ok_or_else(|| StorageError::NoFilesystem(path.to_path_buf()))
}

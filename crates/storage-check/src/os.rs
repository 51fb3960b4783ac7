use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;

use crate::checker::{BLOCK_SIZE, CYCLES};
use crate::error::{Result, StorageError};

/// A mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub dir_name: PathBuf,
    pub fs_type: String,
}

impl Mount {
    pub fn new(dir_name: impl Into<PathBuf>, fs_type: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
            fs_type: fs_type.into(),
        }
    }
}

/// Operating system queries used by the checker.
#[async_trait]
pub trait OsInterface: Send + Sync {
    async fn mounts(&self) -> Result<Vec<Mount>>;

    /// Sequential write throughput in bytes per second, measured by writing
    /// a temporary file under `path`.
    async fn disk_speed(&self, cancel: &CancellationToken, path: &Path, prefix: &str) -> Result<u64>;

    /// Bytes available to unprivileged users on the volume holding `path`.
    async fn disk_capacity(&self, path: &Path) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealOs;

#[async_trait]
impl OsInterface for RealOs {
    async fn mounts(&self) -> Result<Vec<Mount>> {
        let disks = Disks::new_with_refreshed_list();
        Ok(disks
            .list()
            .iter()
            .map(|disk| {
                Mount::new(
                    disk.mount_point(),
                    disk.file_system().to_string_lossy().into_owned(),
                )
            })
            .collect())
    }

    async fn disk_speed(&self, cancel: &CancellationToken, path: &Path, prefix: &str) -> Result<u64> {
        let cancel = cancel.clone();
        let path = path.to_path_buf();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut file = tempfile::Builder::new()
                .prefix(&prefix)
                .tempfile_in(&path)?;
            let buf = vec![0u8; BLOCK_SIZE];

            let start = Instant::now();
            for _ in 0..CYCLES {
                file.write_all(&buf)?;
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
            }
            file.as_file().sync_all()?;
            let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);

            Ok(((BLOCK_SIZE * CYCLES) as f64 / elapsed) as u64)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    async fn disk_capacity(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_real_capacity_of_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let available = RealOs.disk_capacity(dir.path()).await.unwrap();
        assert!(available > 0);
    }

    #[tokio::test]
    async fn test_disk_speed_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = RealOs
            .disk_speed(&cancel, dir.path(), "probe")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

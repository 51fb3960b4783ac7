use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} does not exist")]
    NotFound(PathBuf),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to locate filesystem for {0}")]
    NoFilesystem(PathBuf),

    #[error("storage check cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statvfs failed: {0}")]
    Stat(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, StorageError>;

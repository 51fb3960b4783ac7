//! Console and log file initialisation.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the log file open for the lifetime of the process.
///
/// Dropping the guard syncs the file to disk.
pub struct LoggingGuard {
    file: Arc<File>,
    path: PathBuf,
}

impl LoggingGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.sync_all() {
            eprintln!("failed to sync {}: {err}", self.path.display());
        }
    }
}

/// Default console level: warnings, or informational messages with `verbose`.
fn console_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            LevelFilter::INFO
        } else {
            LevelFilter::WARN
        };
        EnvFilter::new(level.to_string())
    })
}

/// Install a console layer on stderr and a debug-level layer writing to
/// `log_file`, which is truncated first.
pub fn init(log_file: &Path, verbose: bool) -> Result<LoggingGuard> {
    if let Some(dir) = log_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = Arc::new(
        File::create(log_file)
            .with_context(|| format!("failed to open log file {}", log_file.display()))?,
    );

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter(verbose));
    let system = tracing_subscriber::fmt::layer()
        .with_writer(Arc::clone(&file))
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(system)
        .try_init()
        .context("failed to install the tracing subscriber")?;

    Ok(LoggingGuard {
        file,
        path: log_file.to_path_buf(),
    })
}

//! Storage checks on the installer node.

use async_trait::async_trait;
use installer_core::PhaseKind;
use std::path::PathBuf;
use std::sync::Arc;
use storage_check::{OsInterface, RealOs, StorageChecker, StorageConfig};
use tracing::info;

use crate::core::{ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;

/// Validates the storage requirement of the phase.
///
/// Failed probes fail the phase. There is nothing to roll back.
pub struct ChecksExecutor {
    checker: StorageChecker,
    progress: ProgressReporter,
}

impl ChecksExecutor {
    pub fn new(params: ExecutorParams) -> Result<Self> {
        Self::with_os(params, Arc::new(RealOs))
    }

    pub fn with_os(params: ExecutorParams, os: Arc<dyn OsInterface>) -> Result<Self> {
        let requirement = params.phase.data.storage.clone().ok_or_else(|| {
            OrchestratorError::BadParameter(format!(
                "phase {} requires a storage requirement",
                params.phase.id
            ))
        })?;
        let config = StorageConfig {
            path: PathBuf::from(requirement.path),
            will_be_created: requirement.will_be_created,
            filesystems: requirement.filesystems,
            min_free_bytes: requirement.min_free_bytes,
            min_bytes_per_second: requirement.min_bytes_per_second,
        };
        Ok(Self {
            checker: StorageChecker::with_os(config, os),
            progress: params.progress,
        })
    }
}

#[async_trait]
impl PhaseExecutor for ChecksExecutor {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Checks
    }

    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> Result<()> {
        self.progress
            .next_step(format!("Checking storage {}", self.checker.config().path.display()));
        let probes = self.checker.probes(&ctx.cancel).await;
        if ctx.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(self.checker.name()));
        }

        let failed: Vec<String> = probes
            .iter()
            .filter(|probe| probe.is_failed())
            .map(ToString::to_string)
            .collect();
        if !failed.is_empty() {
            return Err(OrchestratorError::ExecutionFailed(failed.join("; ")));
        }
        info!(checker = %self.checker.name(), probes = probes.len(), "Storage checks passed");
        Ok(())
    }

    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing;
    use installer_core::{Phase, PhaseData, StorageRequirement};

    fn phase(requirement: StorageRequirement) -> Phase {
        Phase::new("/checks", "Run storage checks", PhaseKind::Checks).with_data(PhaseData {
            storage: Some(requirement),
            ..Default::default()
        })
    }

    #[test]
    fn test_requires_storage_requirement() {
        let params = testing::params(Phase::new("/checks", "checks", PhaseKind::Checks));
        assert!(matches!(
            ChecksExecutor::new(params).err().unwrap(),
            OrchestratorError::BadParameter(_)
        ));
    }

    #[tokio::test]
    async fn test_capacity_shortfall_fails_phase() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ChecksExecutor::new(testing::params(phase(StorageRequirement {
            path: dir.path().display().to_string(),
            min_free_bytes: u64::MAX,
            ..Default::default()
        })))
        .unwrap();

        let err = executor.execute(&ExecContext::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionFailed(_)));
        assert!(err.to_string().contains("minimum of"));
    }

    #[tokio::test]
    async fn test_no_constraints_pass() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ChecksExecutor::new(testing::params(phase(StorageRequirement {
            path: dir.path().display().to_string(),
            ..Default::default()
        })))
        .unwrap();
        executor.execute(&ExecContext::default()).await.unwrap();
    }
}

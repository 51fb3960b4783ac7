use installer_core::CoreError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Something the phase waits for has not happened yet.
    #[error("{0}")]
    NotReady(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{what}: giving up after {attempts} attempts: {source}")]
    RetryExhausted {
        what: String,
        attempts: u32,
        source: Box<OrchestratorError>,
    },

    #[error("Phase {phase}{} pre-check failed: {source}", on_server(.server))]
    PreCheckFailed {
        phase: String,
        server: Option<String>,
        source: Box<OrchestratorError>,
    },

    #[error("Phase {phase}{} failed: {source}", on_server(.server))]
    PhaseFailed {
        phase: String,
        server: Option<String>,
        source: Box<OrchestratorError>,
    },

    #[error("Rollback failed: {}", RollbackFailures(.failures))]
    RollbackFailed { failures: Vec<RollbackFailure> },
}

/// A phase whose rollback returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    pub phase: String,
    pub error: String,
}

struct RollbackFailures<'a>(&'a [RollbackFailure]);

impl fmt::Display for RollbackFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.phase, failure.error)?;
        }
        Ok(())
    }
}

fn on_server(server: &Option<String>) -> String {
    server
        .as_ref()
        .map(|s| format!(" on {s}"))
        .unwrap_or_default()
}

impl OrchestratorError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::NotReady(_) | Self::Kubernetes(_) | Self::Io(_) => true,
            Self::RetryExhausted { .. } => false,
            Self::PhaseFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::PreCheckFailed { source, .. } | Self::PhaseFailed { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    pub fn phase_failed(
        phase: impl Into<String>,
        server: Option<String>,
        source: OrchestratorError,
    ) -> Self {
        Self::PhaseFailed {
            phase: phase.into(),
            server,
            source: Box::new(source),
        }
    }

    pub fn pre_check_failed(
        phase: impl Into<String>,
        server: Option<String>,
        source: OrchestratorError,
    ) -> Self {
        Self::PreCheckFailed {
            phase: phase.into(),
            server,
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<storage_check::StorageError> for OrchestratorError {
    fn from(err: storage_check::StorageError) -> Self {
        match err {
            storage_check::StorageError::Cancelled => Self::Cancelled(err.to_string()),
            storage_check::StorageError::Io(io) => Self::Io(io),
            other => Self::BadParameter(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OrchestratorError::Conflict("node".into()).is_transient());
        assert!(OrchestratorError::NotReady("planet".into()).is_transient());
        assert!(!OrchestratorError::BadParameter("user".into()).is_transient());
        assert!(!OrchestratorError::Precondition("master".into()).is_transient());
        assert!(!OrchestratorError::Cancelled("wait".into()).is_transient());
    }

    #[test]
    fn test_phase_failure_message_names_server() {
        let err = OrchestratorError::phase_failed(
            "/nodes/node-1",
            Some("node-1(10.0.0.1)".into()),
            OrchestratorError::Conflict("node-1".into()),
        );
        assert_eq!(
            err.to_string(),
            "Phase /nodes/node-1 on node-1(10.0.0.1) failed: Conflict: node-1"
        );

        let err = OrchestratorError::pre_check_failed(
            "/app",
            None,
            OrchestratorError::Precondition("no master".into()),
        );
        assert_eq!(
            err.to_string(),
            "Phase /app pre-check failed: Precondition failed: no master"
        );
    }

    #[test]
    fn test_rollback_failures_are_listed() {
        let err = OrchestratorError::RollbackFailed {
            failures: vec![
                RollbackFailure {
                    phase: "/dns".into(),
                    error: "kubectl exited with 1".into(),
                },
                RollbackFailure {
                    phase: "/checks".into(),
                    error: "boom".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Rollback failed: /dns: kubectl exited with 1; /checks: boom"
        );
    }

    #[test]
    fn test_cancellation_seen_through_wrappers() {
        let err = OrchestratorError::phase_failed(
            "/wait",
            None,
            OrchestratorError::Cancelled("waiting for the planet".into()),
        );
        assert!(err.is_cancelled());
    }
}

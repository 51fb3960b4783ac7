use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Invalid phase state transition for {phase} from {from} to {to}")]
    InvalidStatusTransition {
        phase: String,
        from: String,
        to: String,
    },

    #[error("Phase {phase} requires {} to complete first", pending.join(", "))]
    DependenciesIncomplete { phase: String, pending: Vec<String> },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

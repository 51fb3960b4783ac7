use installer_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Phase {phase} not found in plan {operation}")]
    PhaseNotFound { operation: String, phase: String },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

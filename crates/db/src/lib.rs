mod error;
pub mod models;
mod pool;
pub mod repositories;

pub use error::*;
pub use models::{OperationLog, PhaseRow, PlanRow};
pub use pool::*;
pub use repositories::*;

mod operation_log_repository;
mod plan_repository;

pub use operation_log_repository::*;
pub use plan_repository::*;

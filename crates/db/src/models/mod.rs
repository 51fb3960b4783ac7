mod operation_log;
mod plan;

pub use operation_log::{OperationLog, OperationLogRow};
pub use plan::{PhaseRow, PlanRow};
pub(crate) use plan::datetime_to_timestamp;

use chrono::{DateTime, Utc};

use super::plan::timestamp_to_datetime;

/// One line of output captured while running an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLog {
    pub id: i64,
    pub line: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationLogRow {
    pub id: i64,
    pub operation_id: String,
    pub line: String,
    pub created_at: i64,
}

impl OperationLogRow {
    pub fn into_domain(self) -> OperationLog {
        OperationLog {
            id: self.id,
            line: self.line,
            created_at: timestamp_to_datetime(self.created_at),
        }
    }
}

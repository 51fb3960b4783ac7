use crate::error::DbError;
use crate::models::{datetime_to_timestamp, OperationLog, OperationLogRow};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct OperationLogRepository {
    pool: SqlitePool,
}

impl OperationLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, operation_id: Uuid, line: &str) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO operation_logs (operation_id, line, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(operation_id.to_string())
        .bind(line)
        .bind(datetime_to_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn find_by_operation(&self, operation_id: Uuid) -> Result<Vec<OperationLog>, DbError> {
        let rows: Vec<OperationLogRow> = sqlx::query_as(
            r#"
            SELECT id, operation_id, line, created_at
            FROM operation_logs
            WHERE operation_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(operation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OperationLogRow::into_domain).collect())
    }

    pub async fn count_by_operation(&self, operation_id: Uuid) -> Result<i64, DbError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM operation_logs WHERE operation_id = ?")
                .bind(operation_id.to_string())
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }
}

//! Postgres-backed stack store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use stackd_id::StackId;

use super::{StackStore, StoreError};
use crate::stack::{Stack, StackStatus, StatusCounts};

const STACK_COLUMNS: &str = "id, user_id, problem_id, pod_spec, target_port, node_port, status, \
     created_at, updated_at, expires_at, last_reconciled_at";

fn decode_error(column: &str, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: source.into(),
    }
}

fn port_column(row: &PgRow, column: &str) -> Result<u16, sqlx::Error> {
    let value: i32 = row.try_get(column)?;
    u16::try_from(value).map_err(|e| decode_error(column, e))
}

impl<'r> sqlx::FromRow<'r, PgRow> for Stack {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;

        Ok(Self {
            id: StackId::parse(&id).map_err(|e| decode_error("id", e))?,
            user_id: row.try_get("user_id")?,
            problem_id: row.try_get("problem_id")?,
            pod_spec: row.try_get("pod_spec")?,
            target_port: port_column(row, "target_port")?,
            node_port: port_column(row, "node_port")?,
            status: status
                .parse::<StackStatus>()
                .map_err(|e| decode_error("status", e))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
            last_reconciled_at: row.try_get("last_reconciled_at")?,
        })
    }
}

fn status_names(statuses: &[StackStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Stack records in the `stacks` table.
#[derive(Clone)]
pub struct PgStackStore {
    pool: PgPool,
}

impl PgStackStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StackStore for PgStackStore {
    async fn insert(&self, stack: &Stack) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stacks (
                id,
                user_id,
                problem_id,
                pod_spec,
                target_port,
                node_port,
                status,
                created_at,
                updated_at,
                expires_at,
                last_reconciled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(stack.id.to_string())
        .bind(stack.user_id)
        .bind(stack.problem_id)
        .bind(&stack.pod_spec)
        .bind(i32::from(stack.target_port))
        .bind(i32::from(stack.node_port))
        .bind(stack.status.as_str())
        .bind(stack.created_at)
        .bind(stack.updated_at)
        .bind(stack.expires_at)
        .bind(stack.last_reconciled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, stack.node_port))?;

        Ok(())
    }

    async fn get(&self, id: StackId) -> Result<Option<Stack>, StoreError> {
        sqlx::query_as::<_, Stack>(&format!("SELECT {STACK_COLUMNS} FROM stacks WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    async fn list_all(&self) -> Result<Vec<Stack>, StoreError> {
        sqlx::query_as::<_, Stack>(&format!(
            "SELECT {STACK_COLUMNS} FROM stacks WHERE status <> 'deleted' ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Stack>, StoreError> {
        sqlx::query_as::<_, Stack>(&format!(
            "SELECT {STACK_COLUMNS} FROM stacks \
             WHERE user_id = $1 AND status <> 'deleted' \
             ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn list_active(&self) -> Result<Vec<Stack>, StoreError> {
        sqlx::query_as::<_, Stack>(&format!(
            "SELECT {STACK_COLUMNS} FROM stacks \
             WHERE status IN ('pending', 'running') \
             ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn find_active(&self, user_id: i64, problem_id: i64) -> Result<Option<Stack>, StoreError> {
        sqlx::query_as::<_, Stack>(&format!(
            "SELECT {STACK_COLUMNS} FROM stacks \
             WHERE user_id = $1 AND problem_id = $2 AND status IN ('pending', 'running')"
        ))
        .bind(user_id)
        .bind(problem_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn count_active_for_user(&self, user_id: i64) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stacks WHERE user_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn transition(
        &self,
        id: StackId,
        from: &[StackStatus],
        to: StackStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Stack>, StoreError> {
        sqlx::query_as::<_, Stack>(&format!(
            "UPDATE stacks SET status = $1, updated_at = $2 \
             WHERE id = $3 AND status = ANY($4) \
             RETURNING {STACK_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(at)
        .bind(id.to_string())
        .bind(status_names(from))
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn mark_reconciled(&self, ids: &[StackId], at: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();

        let result = sqlx::query("UPDATE stacks SET last_reconciled_at = $1 WHERE id = ANY($2)")
            .bind(at)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM stacks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(StoreError::Query)?;
            let count: i64 = row.try_get("count").map_err(StoreError::Query)?;
            let status = status
                .parse::<StackStatus>()
                .map_err(|e| StoreError::Query(decode_error("status", e)))?;
            counts.add(status, count);
        }

        Ok(counts)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM stacks \
             WHERE status IN ('expired', 'failed', 'deleted') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }
}

//! PostgreSQL implementation of DlqStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{DlqError, DlqStore};
use super::types::{DlqEntry, DlqFilter, DlqPriority, DlqStatus, LastError, Pagination};
use crate::dispatch::Payload;

const SELECT_COLUMNS: &str = r#"
    SELECT id, job_id, platform, operation, payload, last_error,
           retry_count, max_retries, manual_retry_count, status, priority,
           created_at, last_attempt_at, resolved_at, abandoned_at,
           resolved_by, resolution_notes, metadata, tags
    FROM dead_letter_queue
"#;

const FILTER_CLAUSE: &str = r#"
    WHERE ($1::text IS NULL OR status = $1)
      AND ($2::text IS NULL OR platform = $2)
      AND ($3::smallint IS NULL OR priority = $3)
      AND ($4::text IS NULL OR operation = $4)
      AND ($5::text IS NULL OR job_id = $5)
"#;

const LISTING_ORDER: &str = "ORDER BY priority DESC, created_at ASC, id ASC";

/// PostgreSQL implementation of DlqStore
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::dlq::PostgresDlqStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/dispatch").await?;
/// let store = PostgresDlqStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDlqStore {
    pool: PgPool,
}

impl PostgresDlqStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the crate's migrations
    pub async fn migrate(&self) -> Result<(), DlqError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run DLQ migrations: {}", e);
                DlqError::Database(e.to_string())
            })
    }
}

fn database_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> DlqError {
    move |e| {
        error!("{}: {}", context, e);
        DlqError::Database(e.to_string())
    }
}

fn row_to_entry(row: &PgRow) -> Result<DlqEntry, DlqError> {
    let decode = |e: sqlx::Error| DlqError::Database(e.to_string());

    let status: String = row.try_get("status").map_err(decode)?;
    let priority: i16 = row.try_get("priority").map_err(decode)?;
    let last_error: serde_json::Value = row.try_get("last_error").map_err(decode)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(decode)?;
    let tags: Vec<String> = row.try_get("tags").map_err(decode)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(decode)?;

    Ok(DlqEntry {
        id: row.try_get("id").map_err(decode)?,
        job_id: row.try_get("job_id").map_err(decode)?,
        platform: row.try_get("platform").map_err(decode)?,
        operation: row.try_get("operation").map_err(decode)?,
        payload: Payload::new(payload),
        last_error: serde_json::from_value::<LastError>(last_error)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(decode)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(decode)? as u32,
        manual_retry_count: row.try_get::<i32, _>("manual_retry_count").map_err(decode)? as u32,
        status: status.parse().map_err(DlqError::Database)?,
        priority: DlqPriority::from_rank(priority)
            .ok_or_else(|| DlqError::Database(format!("Unknown DLQ priority rank: {}", priority)))?,
        created_at: row.try_get("created_at").map_err(decode)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(decode)?,
        resolved_at: row.try_get("resolved_at").map_err(decode)?,
        abandoned_at: row.try_get("abandoned_at").map_err(decode)?,
        resolved_by: row.try_get("resolved_by").map_err(decode)?,
        resolution_notes: row.try_get("resolution_notes").map_err(decode)?,
        metadata: serde_json::from_value(metadata)?,
        tags: tags.into_iter().collect(),
    })
}

#[async_trait]
impl DlqStore for PostgresDlqStore {
    #[instrument(skip(self, entry), fields(dlq_id = %entry.id))]
    async fn insert(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        let last_error = serde_json::to_value(&entry.last_error)?;
        let metadata = serde_json::to_value(&entry.metadata)?;
        let tags: Vec<String> = entry.tags.iter().cloned().collect();

        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (
                id, job_id, platform, operation, payload, last_error,
                retry_count, max_retries, manual_retry_count, status, priority,
                created_at, last_attempt_at, resolved_at, abandoned_at,
                resolved_by, resolution_notes, metadata, tags
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.job_id)
        .bind(&entry.platform)
        .bind(&entry.operation)
        .bind(entry.payload.as_bytes())
        .bind(&last_error)
        .bind(entry.retry_count as i32)
        .bind(entry.max_retries as i32)
        .bind(entry.manual_retry_count as i32)
        .bind(entry.status.as_str())
        .bind(entry.priority.rank())
        .bind(entry.created_at)
        .bind(entry.last_attempt_at)
        .bind(entry.resolved_at)
        .bind(entry.abandoned_at)
        .bind(&entry.resolved_by)
        .bind(&entry.resolution_notes)
        .bind(&metadata)
        .bind(&tags)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to insert DLQ entry"))?;

        debug!(job_id = %entry.job_id, "inserted DLQ entry");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, DlqError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error("Failed to get DLQ entry"))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    #[instrument(skip(self, entry), fields(dlq_id = %entry.id))]
    async fn update(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        let all: Vec<String> = DlqStatus::ALL.iter().map(|s| s.to_string()).collect();
        let rows = self.write_entry(entry, &all).await?;
        if rows == 0 {
            return Err(DlqError::NotFound(entry.id));
        }
        Ok(())
    }

    #[instrument(skip(self, entry), fields(dlq_id = %entry.id))]
    async fn update_if(
        &self,
        entry: &DlqEntry,
        expected: &[DlqStatus],
    ) -> Result<Option<DlqStatus>, DlqError> {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        if self.write_entry(entry, &expected).await? > 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT status FROM dead_letter_queue WHERE id = $1")
            .bind(entry.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error("Failed to read DLQ status"))?
            .ok_or(DlqError::NotFound(entry.id))?;

        let status: String = row
            .try_get("status")
            .map_err(|e| DlqError::Database(e.to_string()))?;
        Ok(Some(status.parse().map_err(DlqError::Database)?))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, DlqError> {
        let result = sqlx::query("DELETE FROM dead_letter_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(database_error("Failed to delete DLQ entry"))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        filter: &DlqFilter,
        pagination: Pagination,
    ) -> Result<(Vec<DlqEntry>, u64), DlqError> {
        let count_sql = format!("SELECT COUNT(*) AS total FROM dead_letter_queue {}", FILTER_CLAUSE);
        let total: i64 = bind_filter(sqlx::query(&count_sql), filter)
            .fetch_one(&self.pool)
            .await
            .map_err(database_error("Failed to count DLQ entries"))?
            .try_get("total")
            .map_err(|e| DlqError::Database(e.to_string()))?;

        let list_sql = format!(
            "{} {} {} OFFSET $6 LIMIT $7",
            SELECT_COLUMNS, FILTER_CLAUSE, LISTING_ORDER
        );
        let rows = bind_filter(sqlx::query(&list_sql), filter)
            .bind(pagination.offset as i64)
            .bind(pagination.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(database_error("Failed to list DLQ entries"))?;

        let entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?;
        Ok((entries, total.max(0) as u64))
    }

    #[instrument(skip(self))]
    async fn scan(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, DlqError> {
        let sql = format!("{} {} {}", SELECT_COLUMNS, FILTER_CLAUSE, LISTING_ORDER);
        let rows = bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&self.pool)
            .await
            .map_err(database_error("Failed to scan DLQ entries"))?;

        rows.iter().map(row_to_entry).collect()
    }

    #[instrument(skip(self))]
    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DlqStatus],
    ) -> Result<u64, DlqError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM dead_letter_queue
            WHERE status = ANY($1)
              AND COALESCE(
                    CASE status
                        WHEN 'resolved' THEN resolved_at
                        WHEN 'abandoned' THEN abandoned_at
                    END,
                    last_attempt_at,
                    created_at
                  ) < $2
            "#,
        )
        .bind(&statuses)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to clean up DLQ entries"))?;

        debug!(deleted = result.rows_affected(), "cleaned up DLQ entries");
        Ok(result.rows_affected())
    }
}

impl PostgresDlqStore {
    /// Overwrite the mutable columns while status is one of `expected`
    async fn write_entry(&self, entry: &DlqEntry, expected: &[String]) -> Result<u64, DlqError> {
        let last_error = serde_json::to_value(&entry.last_error)?;
        let metadata = serde_json::to_value(&entry.metadata)?;
        let tags: Vec<String> = entry.tags.iter().cloned().collect();

        let result = sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET last_error = $2,
                retry_count = $3,
                manual_retry_count = $4,
                status = $5,
                priority = $6,
                last_attempt_at = $7,
                resolved_at = $8,
                abandoned_at = $9,
                resolved_by = $10,
                resolution_notes = $11,
                metadata = $12,
                tags = $13
            WHERE id = $1 AND status = ANY($14)
            "#,
        )
        .bind(entry.id)
        .bind(&last_error)
        .bind(entry.retry_count as i32)
        .bind(entry.manual_retry_count as i32)
        .bind(entry.status.as_str())
        .bind(entry.priority.rank())
        .bind(entry.last_attempt_at)
        .bind(entry.resolved_at)
        .bind(entry.abandoned_at)
        .bind(&entry.resolved_by)
        .bind(&entry.resolution_notes)
        .bind(&metadata)
        .bind(&tags)
        .bind(expected.to_vec())
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to update DLQ entry"))?;

        Ok(result.rows_affected())
    }
}

fn bind_filter<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    filter: &'q DlqFilter,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.platform.as_deref())
        .bind(filter.priority.map(|p| p.rank()))
        .bind(filter.operation.as_deref())
        .bind(filter.job_id.as_deref())
}

//! SQLite CorrelationStore implementation.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{
    Asterisk, ColumnDef, Cond, Expr, Func, Index, OnConflict, Order, Query, SqliteQueryBuilder,
    Table,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::model::{NotifyResponse, ProgressUpdate, WaitInstance, WaitQueue};
use crate::storage::schema::{
    no_instance_listing, no_queue_row_for, NotifyResponses, ProgressUpdates, WaitInstances,
    WaitQueueRows,
};
use crate::storage::{CorrelationStore, RecordOutcome, Result, SqliteConfig, StorageError};

const IN_MEMORY_PATH: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite implementation of CorrelationStore.
///
/// Multi-row writes run in one transaction whose first statement is a write,
/// so SQLite takes the write lock up front and concurrent claims serialize.
pub struct SqliteCorrelationStore {
    pool: SqlitePool,
}

impl SqliteCorrelationStore {
    /// Create a store over an existing pool. Call `init` before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the configured database and initialize it.
    ///
    /// `:memory:` databases are pinned to one connection; each SQLite
    /// connection would otherwise see its own empty database.
    pub async fn connect(config: &SqliteConfig) -> Result<Self> {
        let (url, max_connections) = if config.path == IN_MEMORY_PATH {
            ("sqlite::memory:".to_string(), 1)
        } else {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            }
            (
                format!("sqlite:{}", config.path),
                config.max_connections.max(1),
            )
        };

        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        let statements = [
            Table::create()
                .table(WaitInstances::Table)
                .if_not_exists()
                .col(ColumnDef::new(WaitInstances::Id).text().primary_key())
                .col(ColumnDef::new(WaitInstances::Publisher).text().not_null())
                .col(ColumnDef::new(WaitInstances::CorrelationIds).text().not_null())
                .col(ColumnDef::new(WaitInstances::CreatedAt).text().not_null())
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(WaitQueueRows::Table)
                .if_not_exists()
                .col(ColumnDef::new(WaitQueueRows::Id).text().primary_key())
                .col(ColumnDef::new(WaitQueueRows::WaitInstanceId).text().not_null())
                .col(ColumnDef::new(WaitQueueRows::CorrelationId).text().not_null())
                .col(ColumnDef::new(WaitQueueRows::CreatedAt).text().not_null())
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(NotifyResponses::Table)
                .if_not_exists()
                .col(ColumnDef::new(NotifyResponses::CorrelationId).text().primary_key())
                .col(ColumnDef::new(NotifyResponses::Payload).text().not_null())
                .col(ColumnDef::new(NotifyResponses::IsError).boolean().not_null())
                .col(ColumnDef::new(NotifyResponses::CreatedAt).text().not_null())
                .col(ColumnDef::new(NotifyResponses::ValidUntil).text().not_null())
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(ProgressUpdates::Table)
                .if_not_exists()
                .col(ColumnDef::new(ProgressUpdates::Id).text().primary_key())
                .col(ColumnDef::new(ProgressUpdates::CorrelationId).text().not_null())
                .col(ColumnDef::new(ProgressUpdates::Payload).text().not_null())
                .col(ColumnDef::new(ProgressUpdates::CreatedAt).text().not_null())
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_wait_queue_correlation_id")
                .table(WaitQueueRows::Table)
                .col(WaitQueueRows::CorrelationId)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_wait_queue_wait_instance_id")
                .table(WaitQueueRows::Table)
                .col(WaitQueueRows::WaitInstanceId)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_wait_queue_scan")
                .table(WaitQueueRows::Table)
                .col(WaitQueueRows::CreatedAt)
                .col(WaitQueueRows::Id)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_notify_responses_valid_until")
                .table(NotifyResponses::Table)
                .col(NotifyResponses::ValidUntil)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_progress_updates_created_at")
                .table(ProgressUpdates::Table)
                .col(ProgressUpdates::CreatedAt)
                .to_string(SqliteQueryBuilder),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        info!("Correlation tables initialized (SQLite)");
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Fixed-width RFC3339 so text ordering matches time ordering.
fn ts_to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn text_to_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{}: {}", text, e)))
}

fn instance_from_row(row: &SqliteRow) -> Result<WaitInstance> {
    let id: String = row.try_get("id")?;
    let correlation_ids: String = row.try_get("correlation_ids")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(WaitInstance {
        id: Uuid::parse_str(&id)?,
        publisher: row.try_get("publisher")?,
        correlation_ids: serde_json::from_str(&correlation_ids)?,
        created_at: text_to_ts(&created_at)?,
    })
}

fn queue_row_from_row(row: &SqliteRow) -> Result<WaitQueue> {
    let id: String = row.try_get("id")?;
    let wait_instance_id: String = row.try_get("wait_instance_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(WaitQueue {
        id: Uuid::parse_str(&id)?,
        wait_instance_id: Uuid::parse_str(&wait_instance_id)?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: text_to_ts(&created_at)?,
    })
}

fn response_from_row(row: &SqliteRow) -> Result<NotifyResponse> {
    let payload: String = row.try_get("payload")?;
    let created_at: String = row.try_get("created_at")?;
    let valid_until: String = row.try_get("valid_until")?;
    Ok(NotifyResponse {
        correlation_id: row.try_get("correlation_id")?,
        payload: serde_json::from_str(&payload)?,
        is_error: row.try_get("is_error")?,
        created_at: text_to_ts(&created_at)?,
        valid_until: text_to_ts(&valid_until)?,
    })
}

fn progress_from_row(row: &SqliteRow) -> Result<ProgressUpdate> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ProgressUpdate {
        id: Uuid::parse_str(&id)?,
        correlation_id: row.try_get("correlation_id")?,
        payload: serde_json::from_str(&payload)?,
        created_at: text_to_ts(&created_at)?,
    })
}

const INSTANCE_COLUMNS: [WaitInstances; 4] = [
    WaitInstances::Id,
    WaitInstances::Publisher,
    WaitInstances::CorrelationIds,
    WaitInstances::CreatedAt,
];

const QUEUE_COLUMNS: [WaitQueueRows; 4] = [
    WaitQueueRows::Id,
    WaitQueueRows::WaitInstanceId,
    WaitQueueRows::CorrelationId,
    WaitQueueRows::CreatedAt,
];

const RESPONSE_COLUMNS: [NotifyResponses; 5] = [
    NotifyResponses::CorrelationId,
    NotifyResponses::Payload,
    NotifyResponses::IsError,
    NotifyResponses::CreatedAt,
    NotifyResponses::ValidUntil,
];

const PROGRESS_COLUMNS: [ProgressUpdates; 4] = [
    ProgressUpdates::Id,
    ProgressUpdates::CorrelationId,
    ProgressUpdates::Payload,
    ProgressUpdates::CreatedAt,
];

#[async_trait]
impl CorrelationStore for SqliteCorrelationStore {
    async fn create_wait_instance(&self, instance: &WaitInstance) -> Result<()> {
        if instance.correlation_ids.is_empty() {
            return Err(StorageError::EmptyCorrelationIds(instance.id));
        }

        let mut tx = self.pool.begin().await?;

        let insert_instance = Query::insert()
            .into_table(WaitInstances::Table)
            .columns(INSTANCE_COLUMNS)
            .values_panic([
                instance.id.to_string().into(),
                instance.publisher.clone().into(),
                serde_json::to_string(&instance.correlation_ids)?.into(),
                ts_to_text(&instance.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        if let Err(e) = sqlx::query(&insert_instance).execute(&mut *tx).await {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Err(StorageError::DuplicateWaitInstance(instance.id));
                }
            }
            return Err(e.into());
        }

        let insert_rows = {
            let mut query = Query::insert();
            query
                .into_table(WaitQueueRows::Table)
                .columns(QUEUE_COLUMNS);
            for row in instance.queue_rows() {
                query.values_panic([
                    row.id.to_string().into(),
                    row.wait_instance_id.to_string().into(),
                    row.correlation_id.into(),
                    ts_to_text(&row.created_at).into(),
                ]);
            }
            query.to_string(SqliteQueryBuilder)
        };
        sqlx::query(&insert_rows).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_wait_instance(&self, id: Uuid) -> Result<Option<WaitInstance>> {
        let query = Query::select()
            .columns(INSTANCE_COLUMNS)
            .from(WaitInstances::Table)
            .and_where(Expr::col(WaitInstances::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn record_response(&self, response: NotifyResponse) -> Result<RecordOutcome> {
        let query = Query::insert()
            .into_table(NotifyResponses::Table)
            .columns(RESPONSE_COLUMNS)
            .values_panic([
                response.correlation_id.clone().into(),
                serde_json::to_string(&response.payload)?.into(),
                response.is_error.into(),
                ts_to_text(&response.created_at).into(),
                ts_to_text(&response.valid_until).into(),
            ])
            .on_conflict(
                OnConflict::column(NotifyResponses::CorrelationId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(if result.rows_affected() == 0 {
            RecordOutcome::AlreadyRecorded
        } else {
            RecordOutcome::Recorded
        })
    }

    async fn get_response(&self, correlation_id: &str) -> Result<Option<NotifyResponse>> {
        let query = Query::select()
            .columns(RESPONSE_COLUMNS)
            .from(NotifyResponses::Table)
            .and_where(Expr::col(NotifyResponses::CorrelationId).eq(correlation_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(response_from_row).transpose()
    }

    async fn get_responses(&self, correlation_ids: &[String]) -> Result<Vec<NotifyResponse>> {
        if correlation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::select()
            .columns(RESPONSE_COLUMNS)
            .from(NotifyResponses::Table)
            .and_where(Expr::col(NotifyResponses::CorrelationId).is_in(correlation_ids.iter().cloned()))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(response_from_row).collect()
    }

    async fn find_wait_queue_rows(&self, correlation_id: &str) -> Result<Vec<WaitQueue>> {
        let query = Query::select()
            .columns(QUEUE_COLUMNS)
            .from(WaitQueueRows::Table)
            .and_where(Expr::col(WaitQueueRows::CorrelationId).eq(correlation_id))
            .order_by(WaitQueueRows::CreatedAt, Order::Asc)
            .order_by(WaitQueueRows::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(queue_row_from_row).collect()
    }

    async fn delete_wait_queue_row(&self, id: Uuid) -> Result<bool> {
        let query = Query::delete()
            .from_table(WaitQueueRows::Table)
            .and_where(Expr::col(WaitQueueRows::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remaining_count(&self, wait_instance_id: Uuid) -> Result<usize> {
        let query = Query::select()
            .expr(Func::count(Expr::col(Asterisk)))
            .from(WaitQueueRows::Table)
            .and_where(Expr::col(WaitQueueRows::WaitInstanceId).eq(wait_instance_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }

    async fn delete_wait_instance(&self, wait_instance_id: Uuid) -> Result<Option<WaitInstance>> {
        let id = wait_instance_id.to_string();
        let mut tx = self.pool.begin().await?;

        let delete_rows = Query::delete()
            .from_table(WaitQueueRows::Table)
            .and_where(Expr::col(WaitQueueRows::WaitInstanceId).eq(id.clone()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete_rows).execute(&mut *tx).await?;

        let select = Query::select()
            .columns(INSTANCE_COLUMNS)
            .from(WaitInstances::Table)
            .and_where(Expr::col(WaitInstances::Id).eq(id.clone()))
            .to_string(SqliteQueryBuilder);
        let instance = sqlx::query(&select)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(instance_from_row)
            .transpose()?;

        let delete_instance = Query::delete()
            .from_table(WaitInstances::Table)
            .and_where(Expr::col(WaitInstances::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        let removed = sqlx::query(&delete_instance).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(instance.filter(|_| removed.rows_affected() > 0))
    }

    async fn delete_wait_instance_and_responses(
        &self,
        wait_instance_id: Uuid,
    ) -> Result<Option<WaitInstance>> {
        let id = wait_instance_id.to_string();
        let mut tx = self.pool.begin().await?;

        let delete_rows = Query::delete()
            .from_table(WaitQueueRows::Table)
            .and_where(Expr::col(WaitQueueRows::WaitInstanceId).eq(id.clone()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete_rows).execute(&mut *tx).await?;

        let select = Query::select()
            .columns(INSTANCE_COLUMNS)
            .from(WaitInstances::Table)
            .and_where(Expr::col(WaitInstances::Id).eq(id.clone()))
            .to_string(SqliteQueryBuilder);
        let Some(row) = sqlx::query(&select).fetch_optional(&mut *tx).await? else {
            tx.commit().await?;
            return Ok(None);
        };
        let instance = instance_from_row(&row)?;

        let delete_instance = Query::delete()
            .from_table(WaitInstances::Table)
            .and_where(Expr::col(WaitInstances::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        let claimed = sqlx::query(&delete_instance).execute(&mut *tx).await?;
        if claimed.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let delete_responses = Query::delete()
            .from_table(NotifyResponses::Table)
            .and_where(
                Expr::col(NotifyResponses::CorrelationId)
                    .is_in(instance.correlation_ids.iter().cloned()),
            )
            .and_where(Expr::cust(no_queue_row_for("notify_responses.correlation_id")))
            .and_where(Expr::cust(no_instance_listing("notify_responses.correlation_id")))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete_responses).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(Some(instance))
    }

    async fn page_wait_queue(&self, skip: usize, limit: usize) -> Result<Vec<WaitQueue>> {
        let query = Query::select()
            .columns(QUEUE_COLUMNS)
            .from(WaitQueueRows::Table)
            .order_by(WaitQueueRows::CreatedAt, Order::Asc)
            .order_by(WaitQueueRows::Id, Order::Asc)
            .limit(limit as u64)
            .offset(skip as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(queue_row_from_row).collect()
    }

    async fn count_wait_queue_through(&self, row: &WaitQueue) -> Result<usize> {
        let created_at = ts_to_text(&row.created_at);
        let query = Query::select()
            .expr(Func::count(Expr::col(Asterisk)))
            .from(WaitQueueRows::Table)
            .cond_where(
                Cond::any()
                    .add(Expr::col(WaitQueueRows::CreatedAt).lt(created_at.clone()))
                    .add(
                        Cond::all()
                            .add(Expr::col(WaitQueueRows::CreatedAt).eq(created_at))
                            .add(Expr::col(WaitQueueRows::Id).lte(row.id.to_string())),
                    ),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = result.try_get(0)?;
        Ok(count as usize)
    }

    async fn find_stale_responses(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotifyResponse>> {
        let query = Query::select()
            .columns(RESPONSE_COLUMNS)
            .from(NotifyResponses::Table)
            .and_where(Expr::col(NotifyResponses::ValidUntil).lt(ts_to_text(&now)))
            .and_where(Expr::cust(no_queue_row_for("notify_responses.correlation_id")))
            .and_where(Expr::cust(no_instance_listing("notify_responses.correlation_id")))
            .order_by(NotifyResponses::ValidUntil, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(response_from_row).collect()
    }

    async fn delete_response_if_unreferenced(&self, correlation_id: &str) -> Result<bool> {
        let query = Query::delete()
            .from_table(NotifyResponses::Table)
            .and_where(Expr::col(NotifyResponses::CorrelationId).eq(correlation_id))
            .and_where(Expr::cust(no_queue_row_for("notify_responses.correlation_id")))
            .and_where(Expr::cust(no_instance_listing("notify_responses.correlation_id")))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_drained_wait_instances(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WaitInstance>> {
        let query = Query::select()
            .columns(INSTANCE_COLUMNS)
            .from(WaitInstances::Table)
            .and_where(Expr::col(WaitInstances::CreatedAt).lt(ts_to_text(&created_before)))
            .and_where(Expr::cust(
                "NOT EXISTS (SELECT 1 FROM wait_queue q WHERE q.wait_instance_id = wait_instances.id)",
            ))
            .order_by(WaitInstances::CreatedAt, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn record_progress(&self, update: ProgressUpdate) -> Result<()> {
        let query = Query::insert()
            .into_table(ProgressUpdates::Table)
            .columns(PROGRESS_COLUMNS)
            .values_panic([
                update.id.to_string().into(),
                update.correlation_id.into(),
                serde_json::to_string(&update.payload)?.into(),
                ts_to_text(&update.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn next_progress_batch(&self, limit: usize) -> Result<Vec<ProgressUpdate>> {
        let query = Query::select()
            .columns(PROGRESS_COLUMNS)
            .from(ProgressUpdates::Table)
            .order_by(ProgressUpdates::CreatedAt, Order::Asc)
            .order_by(ProgressUpdates::Id, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(progress_from_row).collect()
    }

    async fn delete_progress(&self, id: Uuid) -> Result<bool> {
        let query = Query::delete()
            .from_table(ProgressUpdates::Table)
            .and_where(Expr::col(ProgressUpdates::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

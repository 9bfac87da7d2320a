//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Registered joins.
#[derive(Iden)]
pub enum WaitInstances {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "publisher"]
    Publisher,
    /// JSON array of correlation ids.
    #[iden = "correlation_ids"]
    CorrelationIds,
    #[iden = "created_at"]
    CreatedAt,
}

/// Outstanding (instance, correlation id) pairs.
#[derive(Iden)]
pub enum WaitQueueRows {
    #[iden = "wait_queue"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "wait_instance_id"]
    WaitInstanceId,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "created_at"]
    CreatedAt,
}

/// Responses keyed by correlation id.
#[derive(Iden)]
pub enum NotifyResponses {
    Table,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "payload"]
    Payload,
    #[iden = "is_error"]
    IsError,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "valid_until"]
    ValidUntil,
}

/// Pending progress updates.
#[derive(Iden)]
pub enum ProgressUpdates {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
}

/// True when no queue row carries `{column}`.
///
/// `{column}` is a fully qualified column of the outer query.
pub fn no_queue_row_for(column: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM wait_queue q WHERE q.correlation_id = {})",
        column
    )
}

/// True when no live instance lists `{column}` among its correlation ids.
pub fn no_instance_listing(column: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM wait_instances i, json_each(i.correlation_ids) j \
         WHERE j.value = {})",
        column
    )
}

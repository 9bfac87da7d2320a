//! CorrelationStore trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Result;
use crate::model::{NotifyResponse, ProgressUpdate, WaitInstance, WaitQueue};

/// Result of writing a response for a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First response for this id; stored.
    Recorded,
    /// A response already existed; the stored payload is unchanged.
    AlreadyRecorded,
}

/// Interface for wait/notify persistence.
///
/// Owns all three record kinds. Every delete is delete-if-present and reports
/// whether *this* call removed the record, so duplicate event delivery never
/// errors and racing callers can tell who won.
///
/// A correlation id is *referenced* while any live `WaitInstance` lists it or
/// any `WaitQueue` row carries it. Responses are only ever garbage-collected
/// once unreferenced.
///
/// Implementations:
/// - `MockCorrelationStore`: In-memory storage (standalone and tests)
/// - `SqliteCorrelationStore`: SQLite storage
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Write the instance and one queue row per correlation id.
    ///
    /// Atomic where the backend supports it. Callers compensate partial
    /// writes with `delete_wait_instance`.
    async fn create_wait_instance(&self, instance: &WaitInstance) -> Result<()>;

    /// Load a wait instance by id.
    async fn get_wait_instance(&self, id: Uuid) -> Result<Option<WaitInstance>>;

    /// Store a response. First writer wins.
    async fn record_response(&self, response: NotifyResponse) -> Result<RecordOutcome>;

    /// Load the response for one correlation id.
    async fn get_response(&self, correlation_id: &str) -> Result<Option<NotifyResponse>>;

    /// Load whichever of the given correlation ids have responses.
    async fn get_responses(&self, correlation_ids: &[String]) -> Result<Vec<NotifyResponse>>;

    /// All queue rows waiting on a correlation id (one per waiting instance).
    async fn find_wait_queue_rows(&self, correlation_id: &str) -> Result<Vec<WaitQueue>>;

    /// Delete one queue row. Returns `true` if this call removed it.
    async fn delete_wait_queue_row(&self, id: Uuid) -> Result<bool>;

    /// Number of queue rows still outstanding for an instance.
    async fn remaining_count(&self, wait_instance_id: Uuid) -> Result<usize>;

    /// Remove an instance and its remaining queue rows, leaving responses in
    /// place for other waiters or the orphan sweep. Used by cancel and by
    /// partial-write compensation, so it also removes queue rows whose
    /// instance is already gone. Returns the instance if this call removed it.
    async fn delete_wait_instance(&self, wait_instance_id: Uuid) -> Result<Option<WaitInstance>>;

    /// Atomically remove an instance, its remaining queue rows, and every
    /// response of its correlation ids that is no longer referenced.
    ///
    /// Returns the instance only to the caller that actually removed it; this
    /// is the single-winner completion claim.
    async fn delete_wait_instance_and_responses(
        &self,
        wait_instance_id: Uuid,
    ) -> Result<Option<WaitInstance>>;

    /// A page of queue rows ordered by `(created_at, id)`.
    async fn page_wait_queue(&self, skip: usize, limit: usize) -> Result<Vec<WaitQueue>>;

    /// Number of queue rows ordered at or before `row` (inclusive).
    async fn count_wait_queue_through(&self, row: &WaitQueue) -> Result<usize>;

    /// Unreferenced responses whose `valid_until` is before `now`, oldest
    /// first. These are the orphan sweep's candidates.
    async fn find_stale_responses(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotifyResponse>>;

    /// Delete a response only if nothing references its correlation id.
    async fn delete_response_if_unreferenced(&self, correlation_id: &str) -> Result<bool>;

    /// Instances created before `created_before` that have no queue rows left.
    async fn find_drained_wait_instances(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WaitInstance>>;

    /// Store a progress update.
    async fn record_progress(&self, update: ProgressUpdate) -> Result<()>;

    /// Oldest progress updates first.
    async fn next_progress_batch(&self, limit: usize) -> Result<Vec<ProgressUpdate>>;

    /// Delete a progress update. Returns `true` if this call removed it.
    async fn delete_progress(&self, id: Uuid) -> Result<bool>;
}

//! In-memory correlation store.
//!
//! All records live behind a single lock so multi-record operations
//! (instance + rows, claim + response cleanup) are atomic, matching what the
//! SQL backends get from transactions. Failure toggles let tests exercise
//! transient errors and non-atomic partial writes.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CorrelationStore, RecordOutcome, Result, StorageError};
use crate::model::{NotifyResponse, ProgressUpdate, WaitInstance, WaitQueue};

#[derive(Default)]
struct MockState {
    instances: HashMap<Uuid, WaitInstance>,
    /// Ordered by scan key so paging is a range walk.
    queue: BTreeMap<(DateTime<Utc>, Uuid), WaitQueue>,
    responses: HashMap<String, NotifyResponse>,
    progress: BTreeMap<(DateTime<Utc>, Uuid), ProgressUpdate>,
}

impl MockState {
    fn is_referenced(&self, correlation_id: &str) -> bool {
        self.queue.values().any(|r| r.correlation_id == correlation_id)
            || self
                .instances
                .values()
                .any(|i| i.correlation_ids.iter().any(|c| c == correlation_id))
    }
}

#[derive(Default)]
struct FailureToggles {
    fail_on_write: bool,
    fail_on_read: bool,
    /// Write the instance and this many rows, then fail.
    fail_after_queue_rows: Option<usize>,
}

/// Mock correlation store that keeps records in memory.
#[derive(Default)]
pub struct MockCorrelationStore {
    state: RwLock<MockState>,
    failures: RwLock<FailureToggles>,
}

impl MockCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_write(&self, fail: bool) {
        self.failures.write().await.fail_on_write = fail;
    }

    pub async fn set_fail_on_read(&self, fail: bool) {
        self.failures.write().await.fail_on_read = fail;
    }

    /// Make the next `create_wait_instance` calls persist the instance and
    /// `rows` queue rows before failing, as a non-transactional store would.
    pub async fn set_fail_after_queue_rows(&self, rows: Option<usize>) {
        self.failures.write().await.fail_after_queue_rows = rows;
    }

    pub async fn wait_instance_count(&self) -> usize {
        self.state.read().await.instances.len()
    }

    pub async fn wait_queue_count(&self) -> usize {
        self.state.read().await.queue.len()
    }

    pub async fn response_count(&self) -> usize {
        self.state.read().await.responses.len()
    }

    pub async fn progress_count(&self) -> usize {
        self.state.read().await.progress.len()
    }

    async fn check_write(&self) -> Result<()> {
        if self.failures.read().await.fail_on_write {
            return Err(StorageError::Unavailable("Mock write failure".to_string()));
        }
        Ok(())
    }

    async fn check_read(&self) -> Result<()> {
        if self.failures.read().await.fail_on_read {
            return Err(StorageError::Unavailable("Mock read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CorrelationStore for MockCorrelationStore {
    async fn create_wait_instance(&self, instance: &WaitInstance) -> Result<()> {
        self.check_write().await?;
        if instance.correlation_ids.is_empty() {
            return Err(StorageError::EmptyCorrelationIds(instance.id));
        }
        let fail_after = self.failures.read().await.fail_after_queue_rows;

        let mut state = self.state.write().await;
        if state.instances.contains_key(&instance.id) {
            return Err(StorageError::DuplicateWaitInstance(instance.id));
        }
        state.instances.insert(instance.id, instance.clone());

        for (written, row) in instance.queue_rows().into_iter().enumerate() {
            if fail_after == Some(written) {
                return Err(StorageError::Unavailable(format!(
                    "Mock failure after {} queue rows",
                    written
                )));
            }
            state.queue.insert(row.order_key(), row);
        }
        Ok(())
    }

    async fn get_wait_instance(&self, id: Uuid) -> Result<Option<WaitInstance>> {
        self.check_read().await?;
        Ok(self.state.read().await.instances.get(&id).cloned())
    }

    async fn record_response(&self, response: NotifyResponse) -> Result<RecordOutcome> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        if state.responses.contains_key(&response.correlation_id) {
            return Ok(RecordOutcome::AlreadyRecorded);
        }
        state
            .responses
            .insert(response.correlation_id.clone(), response);
        Ok(RecordOutcome::Recorded)
    }

    async fn get_response(&self, correlation_id: &str) -> Result<Option<NotifyResponse>> {
        self.check_read().await?;
        Ok(self.state.read().await.responses.get(correlation_id).cloned())
    }

    async fn get_responses(&self, correlation_ids: &[String]) -> Result<Vec<NotifyResponse>> {
        self.check_read().await?;
        let state = self.state.read().await;
        Ok(correlation_ids
            .iter()
            .filter_map(|id| state.responses.get(id).cloned())
            .collect())
    }

    async fn find_wait_queue_rows(&self, correlation_id: &str) -> Result<Vec<WaitQueue>> {
        self.check_read().await?;
        let state = self.state.read().await;
        Ok(state
            .queue
            .values()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn delete_wait_queue_row(&self, id: Uuid) -> Result<bool> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        let key = state
            .queue
            .iter()
            .find(|(_, r)| r.id == id)
            .map(|(k, _)| *k);
        Ok(match key {
            Some(key) => state.queue.remove(&key).is_some(),
            None => false,
        })
    }

    async fn remaining_count(&self, wait_instance_id: Uuid) -> Result<usize> {
        self.check_read().await?;
        let state = self.state.read().await;
        Ok(state
            .queue
            .values()
            .filter(|r| r.wait_instance_id == wait_instance_id)
            .count())
    }

    async fn delete_wait_instance(&self, wait_instance_id: Uuid) -> Result<Option<WaitInstance>> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        state
            .queue
            .retain(|_, r| r.wait_instance_id != wait_instance_id);
        Ok(state.instances.remove(&wait_instance_id))
    }

    async fn delete_wait_instance_and_responses(
        &self,
        wait_instance_id: Uuid,
    ) -> Result<Option<WaitInstance>> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        state
            .queue
            .retain(|_, r| r.wait_instance_id != wait_instance_id);

        let Some(instance) = state.instances.remove(&wait_instance_id) else {
            return Ok(None);
        };

        for correlation_id in &instance.correlation_ids {
            if !state.is_referenced(correlation_id) {
                state.responses.remove(correlation_id);
            }
        }
        Ok(Some(instance))
    }

    async fn page_wait_queue(&self, skip: usize, limit: usize) -> Result<Vec<WaitQueue>> {
        self.check_read().await?;
        let state = self.state.read().await;
        Ok(state
            .queue
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_wait_queue_through(&self, row: &WaitQueue) -> Result<usize> {
        self.check_read().await?;
        let state = self.state.read().await;
        Ok(state.queue.range(..=row.order_key()).count())
    }

    async fn find_stale_responses(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotifyResponse>> {
        self.check_read().await?;
        let state = self.state.read().await;
        let mut stale: Vec<NotifyResponse> = state
            .responses
            .values()
            .filter(|r| r.is_stale(now) && !state.is_referenced(&r.correlation_id))
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.valid_until);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn delete_response_if_unreferenced(&self, correlation_id: &str) -> Result<bool> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        if state.is_referenced(correlation_id) {
            return Ok(false);
        }
        Ok(state.responses.remove(correlation_id).is_some())
    }

    async fn find_drained_wait_instances(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WaitInstance>> {
        self.check_read().await?;
        let state = self.state.read().await;
        let mut drained: Vec<WaitInstance> = state
            .instances
            .values()
            .filter(|i| i.created_at < created_before)
            .filter(|i| !state.queue.values().any(|r| r.wait_instance_id == i.id))
            .cloned()
            .collect();
        drained.sort_by_key(|i| i.created_at);
        drained.truncate(limit);
        Ok(drained)
    }

    async fn record_progress(&self, update: ProgressUpdate) -> Result<()> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        state
            .progress
            .insert((update.created_at, update.id), update);
        Ok(())
    }

    async fn next_progress_batch(&self, limit: usize) -> Result<Vec<ProgressUpdate>> {
        self.check_read().await?;
        let state = self.state.read().await;
        Ok(state.progress.values().take(limit).cloned().collect())
    }

    async fn delete_progress(&self, id: Uuid) -> Result<bool> {
        self.check_write().await?;
        let mut state = self.state.write().await;
        let key = state
            .progress
            .iter()
            .find(|(_, u)| u.id == id)
            .map(|(k, _)| *k);
        Ok(match key {
            Some(key) => state.progress.remove(&key).is_some(),
            None => false,
        })
    }
}

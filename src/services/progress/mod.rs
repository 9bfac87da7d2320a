//! Progress dispatcher.
//!
//! Delivers intermediate progress reported with `progress_on` to the
//! handlers of every instance still waiting on the correlation id. Updates
//! are claimed by deleting them before delivery, so each is delivered at
//! most once across processes. Updates nobody waits on are dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::ProgressUpdate;
use crate::registry::CallbackRegistry;
use crate::storage::{CorrelationStore, Result};

/// Progress dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Run the dispatcher in the standalone runtime.
    pub enabled: bool,
    /// Milliseconds between polls.
    pub interval_ms: u64,
    /// Updates taken per poll.
    pub batch_size: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            batch_size: 100,
        }
    }
}

/// Handle to a running dispatcher task.
pub struct ProgressHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProgressHandle {
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Progress dispatcher task ended abnormally");
        }
    }
}

/// Polls stored progress updates and hands them to waiting handlers.
pub struct ProgressDispatcher {
    store: Arc<dyn CorrelationStore>,
    registry: CallbackRegistry,
    config: ProgressConfig,
}

impl ProgressDispatcher {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        registry: CallbackRegistry,
        config: ProgressConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Process one batch. Returns the number of handler deliveries.
    pub async fn run_once(&self) -> Result<usize> {
        let batch = self
            .store
            .next_progress_batch(self.config.batch_size.max(1))
            .await?;

        let mut delivered = 0;
        for update in batch {
            if !self.store.delete_progress(update.id).await? {
                continue;
            }
            delivered += self.deliver(&update).await?;
        }
        Ok(delivered)
    }

    async fn deliver(&self, update: &ProgressUpdate) -> Result<usize> {
        let rows = self.store.find_wait_queue_rows(&update.correlation_id).await?;
        if rows.is_empty() {
            debug!(correlation_id = %update.correlation_id, "No waiters for progress update");
            return Ok(0);
        }

        let mut delivered = 0;
        for row in rows {
            let Some(instance) = self.store.get_wait_instance(row.wait_instance_id).await? else {
                continue;
            };
            let Some(handler) = self.registry.get(&instance.publisher) else {
                warn!(
                    wait_instance_id = %instance.id,
                    publisher = %instance.publisher,
                    "No callback registered for publisher, dropping progress"
                );
                continue;
            };

            match handler
                .notify_progress(&instance, &update.correlation_id, &update.payload)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    wait_instance_id = %instance.id,
                    correlation_id = %update.correlation_id,
                    error = %e,
                    "Progress callback failed"
                ),
            }
        }
        Ok(delivered)
    }

    /// Spawn the dispatcher as a background task.
    pub fn spawn(self) -> ProgressHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let period = Duration::from_millis(self.config.interval_ms.max(1));
            info!(interval_ms = self.config.interval_ms, "Progress dispatcher started");

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Progress dispatch failed");
                        }
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            info!("Progress dispatcher stopped");
                            break;
                        }
                    }
                }
            }
        });

        ProgressHandle {
            cancel: cancel_tx,
            task,
        }
    }
}

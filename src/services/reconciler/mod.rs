//! Background reconciler.
//!
//! Repairs what the event-driven path can miss, on a fixed interval:
//! - missed-event sweep: republishes correlation ids that have a response
//!   but still have waiting queue rows (notify before wait, lost events)
//! - orphan sweep: deletes stale responses nobody references
//! - drained-instance sweep: completes instances whose rows are all gone
//!   but whose completion never ran, and removes partially registered
//!   instances that can never complete
//!
//! Every action is idempotent, so reconcilers in several processes may run
//! against the same store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{EventChannel, NotifyEvent};
use crate::services::consumer::NotifyEventConsumer;
use crate::storage::{CorrelationStore, Result};
use crate::utils::pagination::next_skip;

/// Reconciler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Seconds between passes.
    pub interval_secs: u64,
    /// Queue rows fetched per page during the missed-event sweep.
    pub page_size: usize,
    /// Maximum orphan responses examined per pass.
    pub orphan_batch: usize,
    /// Age an instance must reach before the drained sweep completes it,
    /// leaving the consumer time to finish its own completion.
    pub drained_grace_secs: u64,
    /// Upper bound of the random delay before the first pass.
    pub max_initial_delay_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            page_size: 100,
            orphan_batch: 500,
            drained_grace_secs: 30,
            max_initial_delay_secs: 5,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Queue rows examined by the missed-event sweep.
    pub scanned: usize,
    /// Correlation ids republished.
    pub republished: usize,
    /// Orphan responses deleted.
    pub orphans_deleted: usize,
    /// Drained instances completed.
    pub drained_completed: usize,
    /// Partially registered instances removed without firing.
    pub phantoms_removed: usize,
    /// Sweeps that failed this pass.
    pub failed_sweeps: usize,
}

/// Handle to a running reconciler task.
pub struct ReconcilerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal the reconciler to stop after its current pass.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the task to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }
}

/// Periodic missed-event, orphan and drained-instance sweeps.
pub struct Reconciler {
    store: Arc<dyn CorrelationStore>,
    channel: Arc<dyn EventChannel>,
    consumer: NotifyEventConsumer,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        channel: Arc<dyn EventChannel>,
        consumer: NotifyEventConsumer,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            channel,
            consumer,
            config,
        }
    }

    /// Run every sweep once. A failing sweep is logged and does not stop
    /// the others.
    pub async fn run_once(&self) -> SweepReport {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        match self.sweep_missed_events().await {
            Ok((scanned, republished)) => {
                report.scanned = scanned;
                report.republished = republished;
            }
            Err(e) => {
                error!(error = %e, "Missed-event sweep failed");
                report.failed_sweeps += 1;
            }
        }

        match self.sweep_orphans(Utc::now()).await {
            Ok(deleted) => report.orphans_deleted = deleted,
            Err(e) => {
                error!(error = %e, "Orphan sweep failed");
                report.failed_sweeps += 1;
            }
        }

        match self.sweep_drained().await {
            Ok((completed, phantoms)) => {
                report.drained_completed = completed;
                report.phantoms_removed = phantoms;
            }
            Err(e) => {
                error!(error = %e, "Drained-instance sweep failed");
                report.failed_sweeps += 1;
            }
        }

        #[cfg(feature = "otel")]
        crate::utils::metrics::RECONCILER_DURATION.record(started.elapsed().as_secs_f64(), &[]);

        if report.republished > 0
            || report.orphans_deleted > 0
            || report.drained_completed > 0
            || report.phantoms_removed > 0
        {
            info!(
                scanned = report.scanned,
                republished = report.republished,
                orphans_deleted = report.orphans_deleted,
                drained_completed = report.drained_completed,
                phantoms_removed = report.phantoms_removed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Reconciler pass repaired state"
            );
        } else {
            debug!(scanned = report.scanned, "Reconciler pass found nothing to do");
        }
        report
    }

    /// Page through every queue row and republish ids that already have a
    /// response. Returns (rows scanned, ids republished).
    async fn sweep_missed_events(&self) -> Result<(usize, usize)> {
        let page_size = self.config.page_size.max(1);
        let mut skip = 0;
        let mut carry = 0;
        let mut last_key: Option<(DateTime<Utc>, Uuid)> = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut scanned = 0;
        let mut republished = 0;

        loop {
            let page = self.store.page_wait_queue(skip, page_size).await?;

            for row in &page {
                // Rows at or before the cursor were already handled.
                if last_key.is_some_and(|key| row.order_key() <= key) {
                    continue;
                }
                scanned += 1;

                if !seen.insert(row.correlation_id.clone()) {
                    continue;
                }
                if self.store.get_response(&row.correlation_id).await?.is_none() {
                    continue;
                }

                match self
                    .channel
                    .publish(NotifyEvent::new(row.correlation_id.clone()))
                    .await
                {
                    Ok(()) => {
                        republished += 1;
                        debug!(correlation_id = %row.correlation_id, "Republished missed event");
                    }
                    Err(e) => warn!(
                        correlation_id = %row.correlation_id,
                        error = %e,
                        "Republish failed, retrying next pass"
                    ),
                }
            }

            let remaining = match page.last() {
                Some(last) if page.len() == page_size => {
                    last_key = Some(last_key.map_or(last.order_key(), |k| k.max(last.order_key())));
                    Some(self.store.count_wait_queue_through(last).await?)
                }
                _ => None,
            };

            let step = next_skip(skip, page_size, page.len(), carry, || remaining.unwrap_or(0));
            if step.done {
                break;
            }
            skip = step.next_skip;
            carry = step.carry;
        }

        #[cfg(feature = "otel")]
        crate::utils::metrics::RECONCILER_REPUBLISHED_TOTAL.add(republished as u64, &[]);

        Ok((scanned, republished))
    }

    /// Delete stale responses that no instance or queue row references.
    async fn sweep_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .store
            .find_stale_responses(now, self.config.orphan_batch)
            .await?;

        let mut deleted = 0;
        for response in stale {
            if self
                .store
                .delete_response_if_unreferenced(&response.correlation_id)
                .await?
            {
                deleted += 1;
                debug!(correlation_id = %response.correlation_id, "Deleted orphan response");
            }
        }

        #[cfg(feature = "otel")]
        crate::utils::metrics::RECONCILER_ORPHANS_TOTAL.add(deleted as u64, &[]);

        Ok(deleted)
    }

    /// Complete instances left with no queue rows by a consumer that stopped
    /// between deleting the last row and claiming the instance.
    ///
    /// An instance missing a response for some id had rows that were never
    /// written (an uncompensated partial registration). It is removed
    /// without firing, keeping its responses for other waiters.
    /// Returns (completed, removed).
    async fn sweep_drained(&self) -> Result<(usize, usize)> {
        let grace = chrono::Duration::seconds(self.config.drained_grace_secs as i64);
        let drained = self
            .store
            .find_drained_wait_instances(Utc::now() - grace, self.config.page_size.max(1))
            .await?;

        let mut completed = 0;
        let mut removed = 0;
        for instance in drained {
            let found = self.store.get_responses(&instance.correlation_ids).await?;
            if found.len() < instance.correlation_ids.len() {
                if self.store.delete_wait_instance(instance.id).await?.is_some() {
                    removed += 1;
                    error!(
                        wait_instance_id = %instance.id,
                        publisher = %instance.publisher,
                        expected = instance.correlation_ids.len(),
                        found = found.len(),
                        "Removed partially registered wait instance"
                    );
                }
                continue;
            }

            if self.consumer.complete(instance.id).await? {
                completed += 1;
                warn!(wait_instance_id = %instance.id, "Completed drained wait instance");
            }
        }

        #[cfg(feature = "otel")]
        crate::utils::metrics::RECONCILER_PHANTOMS_TOTAL.add(removed as u64, &[]);

        Ok((completed, removed))
    }

    /// Spawn the reconciler as a background task.
    ///
    /// The first pass waits a random delay up to `max_initial_delay_secs`
    /// so reconcilers started together do not run in lockstep.
    pub fn spawn(self) -> ReconcilerHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let initial_delay = match self.config.max_initial_delay_secs {
                0 => Duration::ZERO,
                max => Duration::from_millis(rand::rng().random_range(0..=max * 1000)),
            };
            info!(
                interval_secs = self.config.interval_secs,
                initial_delay_ms = initial_delay.as_millis() as u64,
                "Reconciler started"
            );

            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = cancel_rx.changed() => {
                    info!("Reconciler stopped");
                    return;
                }
            }

            let mut interval = tokio::time::interval(self.config.interval().max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            info!("Reconciler stopped");
                            break;
                        }
                    }
                }
            }
        });

        ReconcilerHandle {
            cancel: cancel_tx,
            task,
        }
    }
}

#[cfg(test)]
mod tests;

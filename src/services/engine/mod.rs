//! Notify API: register joins and record results.
//!
//! `wait_for_all` and `notify` carry no ordering requirement between them.
//! A notify that lands before its waiter registers is picked up by the
//! reconciler's missed-event sweep.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, EventChannel, NotifyEvent};
use crate::model::{NotifyResponse, Payload, ProgressUpdate, WaitInstance};
use crate::storage::{CorrelationStore, RecordOutcome, StorageError};
use crate::utils::retry::{is_retryable_bus_error, publish_backoff};

/// Notify API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an unconsumed response is kept before the orphan sweep may
    /// collect it.
    pub response_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_ttl_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_secs)
    }
}

/// Errors returned by the Notify API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("wait_for_all requires at least one correlation id")]
    NoCorrelationIds,

    #[error("Publisher name must not be empty")]
    EmptyPublisher,

    #[error("Correlation id must not be empty")]
    EmptyCorrelationId,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Channel error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Entry point for callers that wait on, or complete, async operations.
#[derive(Clone)]
pub struct WaitNotifyEngine {
    store: Arc<dyn CorrelationStore>,
    channel: Arc<dyn EventChannel>,
    config: EngineConfig,
}

impl WaitNotifyEngine {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        channel: Arc<dyn EventChannel>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            channel,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CorrelationStore> {
        &self.store
    }

    /// Register a join over `correlation_ids`, completed by the handler
    /// registered as `publisher`. Repeated ids are collapsed.
    ///
    /// Returns the wait instance id.
    #[tracing::instrument(name = "engine.wait_for_all", skip_all, fields(publisher = %publisher))]
    pub async fn wait_for_all<I, S>(&self, publisher: &str, correlation_ids: I) -> Result<Uuid>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if publisher.is_empty() {
            return Err(EngineError::EmptyPublisher);
        }

        let instance = WaitInstance::new(publisher, correlation_ids);
        if instance.correlation_ids.is_empty() {
            return Err(EngineError::NoCorrelationIds);
        }
        if instance.correlation_ids.iter().any(|id| id.is_empty()) {
            return Err(EngineError::EmptyCorrelationId);
        }

        if let Err(e) = self.store.create_wait_instance(&instance).await {
            warn!(
                wait_instance_id = %instance.id,
                error = %e,
                "Wait registration failed, removing partial state"
            );
            if let Err(cleanup) = self.store.delete_wait_instance(instance.id).await {
                error!(
                    wait_instance_id = %instance.id,
                    error = %cleanup,
                    "Compensating cleanup failed"
                );
            }
            return Err(e.into());
        }

        #[cfg(feature = "otel")]
        crate::utils::metrics::WAIT_REGISTERED_TOTAL
            .add(1, &[crate::utils::metrics::publisher_attr(publisher)]);

        info!(
            wait_instance_id = %instance.id,
            correlation_ids = instance.correlation_ids.len(),
            "Wait registered"
        );
        Ok(instance.id)
    }

    /// Record a successful result and announce it.
    ///
    /// Returns the response id, which is the correlation id.
    #[tracing::instrument(name = "engine.notify", skip_all, fields(correlation_id = %correlation_id))]
    pub async fn notify(&self, correlation_id: &str, payload: Payload) -> Result<String> {
        self.record_and_publish(correlation_id, payload, false).await
    }

    /// Record a failed result and announce it.
    #[tracing::instrument(name = "engine.notify_error", skip_all, fields(correlation_id = %correlation_id))]
    pub async fn notify_error(&self, correlation_id: &str, payload: Payload) -> Result<String> {
        self.record_and_publish(correlation_id, payload, true).await
    }

    /// Drop a pending wait without firing its callback.
    ///
    /// Responses already recorded for its ids stay until the orphan sweep.
    /// Returns `false` if the instance had already completed or been cancelled.
    #[tracing::instrument(name = "engine.cancel", skip(self))]
    pub async fn cancel(&self, wait_instance_id: Uuid) -> Result<bool> {
        let removed = self.store.delete_wait_instance(wait_instance_id).await?;
        if removed.is_some() {
            info!("Wait cancelled");
        }
        Ok(removed.is_some())
    }

    /// Report intermediate progress for a running operation.
    ///
    /// Delivered best-effort to handlers of instances waiting on the id.
    #[tracing::instrument(name = "engine.progress_on", skip_all, fields(correlation_id = %correlation_id))]
    pub async fn progress_on(&self, correlation_id: &str, payload: Payload) -> Result<Uuid> {
        if correlation_id.is_empty() {
            return Err(EngineError::EmptyCorrelationId);
        }
        let update = ProgressUpdate::new(correlation_id, payload);
        let id = update.id;
        self.store.record_progress(update).await?;
        debug!(progress_id = %id, "Progress recorded");
        Ok(id)
    }

    async fn record_and_publish(
        &self,
        correlation_id: &str,
        payload: Payload,
        is_error: bool,
    ) -> Result<String> {
        if correlation_id.is_empty() {
            return Err(EngineError::EmptyCorrelationId);
        }

        let response =
            NotifyResponse::new(correlation_id, payload, is_error, self.config.response_ttl());

        // Durable before the event exists, so any consumer of the event finds it.
        let outcome = self.store.record_response(response).await?;
        match outcome {
            RecordOutcome::Recorded => debug!(is_error, "Response recorded"),
            RecordOutcome::AlreadyRecorded => {
                info!("Response already recorded, keeping first payload")
            }
        }

        #[cfg(feature = "otel")]
        crate::utils::metrics::NOTIFY_TOTAL.add(
            1,
            &[crate::utils::metrics::outcome_attr(match outcome {
                RecordOutcome::Recorded => "recorded",
                RecordOutcome::AlreadyRecorded => "duplicate",
            })],
        );

        self.publish(correlation_id).await;
        Ok(correlation_id.to_string())
    }

    /// Publish with retries. A publish that still fails is left to the
    /// reconciler; the response is already durable.
    async fn publish(&self, correlation_id: &str) {
        let event = NotifyEvent::new(correlation_id);
        let result = (|| async { self.channel.publish(event.clone()).await })
            .retry(publish_backoff())
            .when(is_retryable_bus_error)
            .notify(|err: &BusError, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Publish failed, retrying");
            })
            .await;

        if let Err(e) = result {
            warn!(error = %e, "Publish failed, reconciler will republish");
            #[cfg(feature = "otel")]
            crate::utils::metrics::PUBLISH_DEFERRED_TOTAL.add(1, &[]);
        }
    }
}

#[cfg(test)]
mod tests;

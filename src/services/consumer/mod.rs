//! Event consumer: resolves queue rows and completes wait instances.
//!
//! For each delivered correlation id, every queue row waiting on it is
//! deleted. The worker whose delete leaves an instance with no rows tries
//! to complete it. Completion is claimed by removing the instance row, so
//! concurrent workers racing on the same instance fire its callback once.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, NotifyEvent, NotifyEventHandler};
use crate::model::{NotifyResponse, ResponseMap, WaitInstance};
use crate::registry::CallbackRegistry;
use crate::storage::{CorrelationStore, Result};
use crate::utils::retry::is_retryable_storage_error;

/// What handling one event did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Queue rows this call removed.
    pub matched: usize,
    /// Instances whose completion this call claimed.
    pub completed: Vec<Uuid>,
}

/// How a claimed instance was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Success,
    Error,
    Unregistered,
}

impl Dispatch {
    #[cfg_attr(not(feature = "otel"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Dispatch::Success => "success",
            Dispatch::Error => "error",
            Dispatch::Unregistered => "unregistered",
        }
    }
}

/// Consumes notify events and dispatches completed joins.
#[derive(Clone)]
pub struct NotifyEventConsumer {
    store: Arc<dyn CorrelationStore>,
    registry: CallbackRegistry,
}

impl NotifyEventConsumer {
    pub fn new(store: Arc<dyn CorrelationStore>, registry: CallbackRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Process one event. Events with no matching rows are a no-op.
    #[tracing::instrument(name = "consumer.handle", skip_all, fields(correlation_id = %event.correlation_id))]
    pub async fn handle_event(&self, event: &NotifyEvent) -> Result<ConsumeOutcome> {
        let mut outcome = ConsumeOutcome::default();

        let rows = self.store.find_wait_queue_rows(&event.correlation_id).await?;
        if rows.is_empty() {
            debug!("No waiters for correlation id");
            return Ok(outcome);
        }

        // The response is written before any event for it is published.
        if self.store.get_response(&event.correlation_id).await?.is_none() {
            warn!("Event for correlation id without a response, ignoring");
            return Ok(outcome);
        }

        for row in rows {
            if !self.store.delete_wait_queue_row(row.id).await? {
                // Another worker resolved this row and will check completion.
                continue;
            }
            outcome.matched += 1;

            if self.store.remaining_count(row.wait_instance_id).await? == 0
                && self.complete(row.wait_instance_id).await?
            {
                outcome.completed.push(row.wait_instance_id);
            }
        }

        Ok(outcome)
    }

    /// Claim and dispatch a wait instance with no outstanding rows.
    ///
    /// Returns `true` only for the caller that won the claim. An instance
    /// missing a response for any of its ids is never completed.
    pub async fn complete(&self, wait_instance_id: Uuid) -> Result<bool> {
        let Some(instance) = self.store.get_wait_instance(wait_instance_id).await? else {
            return Ok(false);
        };
        let responses = self.store.get_responses(&instance.correlation_ids).await?;
        if responses.len() < instance.correlation_ids.len() {
            // Rows gone but ids unresolved: a partial registration. The
            // drained-instance sweep removes it.
            warn!(
                wait_instance_id = %wait_instance_id,
                expected = instance.correlation_ids.len(),
                found = responses.len(),
                "Wait instance has no pending rows but missing responses, not completing"
            );
            return Ok(false);
        }

        let Some(instance) = self
            .store
            .delete_wait_instance_and_responses(instance.id)
            .await?
        else {
            debug!(wait_instance_id = %wait_instance_id, "Completion claimed by another worker");
            return Ok(false);
        };

        let dispatch = self.dispatch(&instance, responses).await;

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{
                outcome_attr, publisher_attr, COMPLETION_LATENCY, COMPLETION_TOTAL,
            };
            let attrs = [publisher_attr(&instance.publisher), outcome_attr(dispatch.as_str())];
            COMPLETION_TOTAL.add(1, &attrs);
            let elapsed = chrono::Utc::now() - instance.created_at;
            COMPLETION_LATENCY.record(elapsed.num_milliseconds() as f64 / 1000.0, &attrs);
        }

        info!(
            wait_instance_id = %instance.id,
            publisher = %instance.publisher,
            outcome = ?dispatch,
            "Wait completed"
        );
        Ok(true)
    }

    /// Invoke the registered handler. Errors are logged; the instance is
    /// already gone, so the callback fires at most once.
    async fn dispatch(&self, instance: &WaitInstance, responses: Vec<NotifyResponse>) -> Dispatch {
        let has_errors = responses.iter().any(|r| r.is_error);
        let map: ResponseMap = responses
            .into_iter()
            .filter(|r| !has_errors || r.is_error)
            .map(|r| (r.correlation_id, r.payload))
            .collect();

        let Some(handler) = self.registry.get(&instance.publisher) else {
            error!(
                wait_instance_id = %instance.id,
                publisher = %instance.publisher,
                "No callback registered for publisher, dropping completion"
            );
            #[cfg(feature = "otel")]
            crate::utils::metrics::CALLBACK_UNREGISTERED_TOTAL
                .add(1, &[crate::utils::metrics::publisher_attr(&instance.publisher)]);
            return Dispatch::Unregistered;
        };

        let (dispatch, result) = if has_errors {
            (Dispatch::Error, handler.notify_error(instance, map).await)
        } else {
            (Dispatch::Success, handler.notify(instance, map).await)
        };

        if let Err(e) = result {
            error!(
                wait_instance_id = %instance.id,
                publisher = %instance.publisher,
                error = %e,
                "Callback failed"
            );
        }
        dispatch
    }
}

impl NotifyEventHandler for NotifyEventConsumer {
    fn handle(&self, event: NotifyEvent) -> BoxFuture<'static, std::result::Result<(), BusError>> {
        let consumer = self.clone();
        Box::pin(async move {
            match consumer.handle_event(&event).await {
                Ok(_) => Ok(()),
                Err(e) if is_retryable_storage_error(&e) => Err(BusError::HandlerFailed {
                    correlation_id: event.correlation_id,
                    message: e.to_string(),
                }),
                Err(e) => {
                    error!(
                        correlation_id = %event.correlation_id,
                        error = %e,
                        "Event handling failed permanently"
                    );
                    Ok(())
                }
            }
        })
    }
}

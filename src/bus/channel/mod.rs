//! In-memory channel-based event channel for standalone mode.
//!
//! Uses a tokio mpsc queue shared by a pool of worker tasks, so each event
//! is taken by exactly one worker and handled by every subscribed handler.
//! A handler error puts the event back on the queue after a delay, up to a
//! bounded number of redeliveries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{BusError, EventChannel, NotifyEvent, NotifyEventHandler, Result};

/// Configuration for channel event channel.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Number of concurrent worker tasks.
    pub workers: usize,
    /// Queue capacity; publishes fail once it is full.
    pub capacity: usize,
    /// Redeliveries after a handler error before the event is dropped.
    pub max_redeliveries: u32,
    /// Delay before a failed event is queued again.
    pub redelivery_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
            max_redeliveries: 5,
            redelivery_delay_ms: 100,
        }
    }
}

impl ChannelConfig {
    /// Set the number of worker tasks.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the redelivery delay.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Queued event plus its delivery attempt (0 = first delivery).
#[derive(Debug, Clone)]
struct Envelope {
    event: NotifyEvent,
    attempt: u32,
}

type Handlers = Arc<RwLock<Vec<Arc<dyn NotifyEventHandler>>>>;

/// In-memory event channel backed by a shared work queue.
pub struct ChannelEventChannel {
    sender: mpsc::Sender<Envelope>,
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    config: ChannelConfig,
    handlers: Handlers,
    /// Flag indicating if worker tasks are running.
    consuming: Arc<RwLock<bool>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChannelEventChannel {
    /// Create a new channel event channel.
    pub fn new(config: ChannelConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            workers = config.workers,
            capacity = config.capacity,
            "Channel event channel initialized"
        );

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            config,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: Arc::new(RwLock::new(false)),
            shutdown_tx,
        }
    }

    /// Number of events queued and not yet taken by a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Start worker tasks (call after subscribe).
    async fn start_consuming_impl(&self) -> Result<()> {
        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return Ok(());
            }
            *consuming = true;
        }

        let workers = self.config.workers.max(1);
        for worker in 0..workers {
            let receiver = self.receiver.clone();
            let sender = self.sender.clone();
            let handlers = self.handlers.clone();
            let config = self.config.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            envelope = receiver.recv() => envelope,
                            _ = shutdown_rx.changed() => None,
                        }
                    };

                    let Some(envelope) = envelope else {
                        debug!(worker, "Channel worker stopping");
                        break;
                    };

                    deliver(&handlers, &sender, &config, envelope).await;
                }
            });
        }

        info!(workers, "Channel consumer started");
        Ok(())
    }
}

/// Hand one event to every handler; requeue it on failure.
async fn deliver(
    handlers: &Handlers,
    sender: &mpsc::Sender<Envelope>,
    config: &ChannelConfig,
    envelope: Envelope,
) {
    let snapshot: Vec<Arc<dyn NotifyEventHandler>> = handlers.read().await.clone();
    let mut failed = false;

    for handler in snapshot {
        if let Err(e) = handler.handle(envelope.event.clone()).await {
            warn!(
                correlation_id = %envelope.event.correlation_id,
                attempt = envelope.attempt,
                error = %e,
                "Handler failed"
            );
            failed = true;
        }
    }

    if !failed {
        return;
    }

    if envelope.attempt >= config.max_redeliveries {
        error!(
            correlation_id = %envelope.event.correlation_id,
            attempts = envelope.attempt + 1,
            "Giving up on event, reconciler will republish"
        );
        return;
    }

    let sender = sender.clone();
    let delay = Duration::from_millis(config.redelivery_delay_ms);
    let retry = Envelope {
        event: envelope.event,
        attempt: envelope.attempt + 1,
    };
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if sender.send(retry).await.is_err() {
            debug!("Channel closed before redelivery");
        }
    });
}

#[async_trait]
impl EventChannel for ChannelEventChannel {
    #[tracing::instrument(name = "channel.publish", skip_all, fields(correlation_id = %event.correlation_id))]
    async fn publish(&self, event: NotifyEvent) -> Result<()> {
        let envelope = Envelope { event, attempt: 0 };
        match self.sender.try_send(envelope) {
            Ok(()) => {
                debug!("Published notify event to channel");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(BusError::Publish("channel is full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
        }
    }

    async fn subscribe(&self, handler: Arc<dyn NotifyEventHandler>) -> Result<()> {
        let count = {
            let mut handlers = self.handlers.write().await;
            handlers.push(handler);
            handlers.len()
        };

        info!(handler_count = count, "Handler subscribed to channel");
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        self.start_consuming_impl().await
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("Channel consumer shutdown requested");
    }
}

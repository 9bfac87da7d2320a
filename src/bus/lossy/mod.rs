//! Lossy event channel for exercising the reconciler.
//!
//! Wraps any `EventChannel` and silently discards a fraction of publishes.
//! A discarded publish still reports success to the engine, leaving the
//! response durable but unannounced: the state the missed-event sweep
//! repairs.
//!
//! ```ignore
//! let inner = ChannelEventChannel::new(ChannelConfig::default());
//! let lossy = LossyEventChannel::new(inner, LossyConfig::with_drop_rate(0.3));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use super::{EventChannel, NotifyEvent, NotifyEventHandler, Result};

/// How many publishes to discard.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossyConfig {
    /// Probability of discarding a publish, within 0.0..=1.0.
    pub drop_rate: f64,
}

impl LossyConfig {
    /// Clamps `rate` into 0.0..=1.0.
    pub fn with_drop_rate(rate: f64) -> Self {
        Self {
            drop_rate: rate.clamp(0.0, 1.0),
        }
    }

    pub fn is_lossy(&self) -> bool {
        self.drop_rate > 0.0
    }
}

/// Publish counters, shared with whoever holds a `stats()` handle.
#[derive(Debug, Default)]
pub struct LossyStats {
    dropped: AtomicU64,
    passed: AtomicU64,
}

impl LossyStats {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.dropped() + self.passed()
    }
}

/// Channel wrapper that discards publishes at random.
pub struct LossyEventChannel<C: EventChannel> {
    inner: C,
    config: LossyConfig,
    stats: Arc<LossyStats>,
}

impl<C: EventChannel> LossyEventChannel<C> {
    pub fn new(inner: C, config: LossyConfig) -> Self {
        if config.is_lossy() {
            warn!(
                drop_rate = config.drop_rate,
                "Lossy event channel enabled, notify events will be discarded"
            );
        }
        Self {
            inner,
            config,
            stats: Arc::new(LossyStats::default()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Counters that stay readable after the wrapper moves into an `Arc<dyn>`.
    pub fn stats(&self) -> Arc<LossyStats> {
        self.stats.clone()
    }

    fn should_drop(&self) -> bool {
        match self.config.drop_rate {
            r if r <= 0.0 => false,
            r if r >= 1.0 => true,
            r => rand::rng().random::<f64>() < r,
        }
    }
}

#[async_trait]
impl<C: EventChannel> EventChannel for LossyEventChannel<C> {
    async fn publish(&self, event: NotifyEvent) -> Result<()> {
        if self.should_drop() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %event.correlation_id, "Discarded notify event");
            return Ok(());
        }
        self.stats.passed.fetch_add(1, Ordering::Relaxed);
        self.inner.publish(event).await
    }

    async fn subscribe(&self, handler: Arc<dyn NotifyEventHandler>) -> Result<()> {
        self.inner.subscribe(handler).await
    }

    async fn start_consuming(&self) -> Result<()> {
        self.inner.start_consuming().await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

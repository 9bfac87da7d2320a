//! Event channel for notify events.
//!
//! This module contains:
//! - `EventChannel` trait: at-least-once delivery of correlation ids
//! - `NotifyEventHandler` trait: for processing delivered events
//! - Channel configuration types
//! - Implementations: Channel (in-process work queue), Mock, Lossy wrapper

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod channel;
#[cfg(feature = "lossy")]
pub mod lossy;
pub mod mock;

pub use channel::{ChannelConfig, ChannelEventChannel};
#[cfg(feature = "lossy")]
pub use lossy::{LossyConfig, LossyEventChannel, LossyStats};
pub use mock::MockEventChannel;

// ============================================================================
// Traits
// ============================================================================

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed for correlation id '{correlation_id}': {message}")]
    HandlerFailed {
        correlation_id: String,
        message: String,
    },

    #[error("Channel closed")]
    Closed,

    #[error("Subscribe not supported for this channel type")]
    SubscribeNotSupported,
}

/// Message carried on the channel: one resolved correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub correlation_id: String,
}

impl NotifyEvent {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
        }
    }
}

/// Handler for processing events from the channel.
///
/// Delivery is at-least-once and unordered; handlers must tolerate
/// duplicates. Returning `Err` asks the channel to redeliver.
pub trait NotifyEventHandler: Send + Sync {
    fn handle(&self, event: NotifyEvent) -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

/// Interface for moving notify events between producers and consumers.
///
/// Implementations:
/// - `ChannelEventChannel`: in-process queue with worker tasks
/// - `MockEventChannel`: records publishes for testing
/// - `LossyEventChannel`: drops a fraction of publishes (feature `lossy`)
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publish one event. Returns once the event is queued.
    async fn publish(&self, event: NotifyEvent) -> Result<()>;

    /// Register a handler. Every handler sees every delivered event.
    async fn subscribe(&self, handler: Arc<dyn NotifyEventHandler>) -> Result<()>;

    /// Start delivering queued events to subscribed handlers.
    async fn start_consuming(&self) -> Result<()> {
        Ok(())
    }

    /// Stop delivering. Queued events that were never handled are dropped;
    /// the reconciler republishes them from durable state.
    async fn shutdown(&self) {}
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process channel with worker tasks.
    #[default]
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Channel-specific configuration.
    pub channel: ChannelConfig,
    /// Fraction of publishes to drop (0.0 to 1.0). Requires feature `lossy`.
    pub drop_rate: f64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            channel: ChannelConfig::default(),
            drop_rate: 0.0,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the event channel based on configuration.
pub async fn init_event_channel(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn EventChannel>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            let channel = ChannelEventChannel::new(config.channel.clone());

            if config.drop_rate > 0.0 {
                #[cfg(feature = "lossy")]
                {
                    let lossy =
                        LossyEventChannel::new(channel, LossyConfig::with_drop_rate(config.drop_rate));
                    info!(messaging_type = "channel", lossy = true, "Event channel initialized");
                    return Ok(Arc::new(lossy));
                }

                #[cfg(not(feature = "lossy"))]
                warn!(
                    drop_rate = config.drop_rate,
                    "drop_rate ignored: rebuild with --features lossy"
                );
            }

            info!(messaging_type = "channel", "Event channel initialized");
            Ok(Arc::new(channel))
        }
    }
}

//! Mock event channel implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, EventChannel, NotifyEvent, NotifyEventHandler, Result};

/// Mock event channel that records publishes instead of delivering them.
#[derive(Default)]
pub struct MockEventChannel {
    published: RwLock<Vec<NotifyEvent>>,
    fail_on_publish: RwLock<bool>,
}

impl MockEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Correlation ids published so far, in publish order.
    pub async fn published_ids(&self) -> Vec<String> {
        self.published
            .read()
            .await
            .iter()
            .map(|e| e.correlation_id.clone())
            .collect()
    }

    pub async fn take_published(&self) -> Vec<NotifyEvent> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl EventChannel for MockEventChannel {
    async fn publish(&self, event: NotifyEvent) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published.write().await.push(event);
        Ok(())
    }

    async fn subscribe(&self, _handler: Arc<dyn NotifyEventHandler>) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }
}

//! Callback registry.
//!
//! Maps a publisher name, persisted on each `WaitInstance`, to the handler
//! that completes it. Built once at startup and read-only afterwards; the
//! consumer and progress dispatcher hold it behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::model::{Payload, ResponseMap, WaitInstance};

/// Error returned by a callback. Logged by the consumer; never retried.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Callback failed: {0}")]
    Failed(String),

    #[error("Callback rejected responses: {0}")]
    Rejected(String),
}

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Publisher already registered: {0}")]
    DuplicatePublisher(String),

    #[error("Publisher name must not be empty")]
    EmptyPublisher,
}

/// Domain handler invoked when a wait instance resolves.
#[async_trait]
pub trait NotifyCallback: Send + Sync {
    /// Every correlation id resolved and none of them is an error.
    async fn notify(
        &self,
        instance: &WaitInstance,
        responses: ResponseMap,
    ) -> Result<(), CallbackError>;

    /// Every correlation id resolved and at least one is an error.
    /// `responses` holds only the error responses.
    async fn notify_error(
        &self,
        instance: &WaitInstance,
        responses: ResponseMap,
    ) -> Result<(), CallbackError>;

    /// Intermediate progress for one of the instance's correlation ids.
    async fn notify_progress(
        &self,
        _instance: &WaitInstance,
        _correlation_id: &str,
        _progress: &Payload,
    ) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Immutable publisher name to handler map.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    handlers: Arc<HashMap<String, Arc<dyn NotifyCallback>>>,
}

impl CallbackRegistry {
    pub fn builder() -> CallbackRegistryBuilder {
        CallbackRegistryBuilder::default()
    }

    /// Resolve the handler for a publisher name.
    pub fn get(&self, publisher: &str) -> Option<Arc<dyn NotifyCallback>> {
        self.handlers.get(publisher).cloned()
    }

    pub fn contains(&self, publisher: &str) -> bool {
        self.handlers.contains_key(publisher)
    }

    pub fn publishers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("publishers", &self.publishers())
            .finish()
    }
}

/// Collects handlers before the registry is frozen.
#[derive(Default)]
pub struct CallbackRegistryBuilder {
    handlers: HashMap<String, Arc<dyn NotifyCallback>>,
}

impl CallbackRegistryBuilder {
    /// Register a handler under a publisher name.
    pub fn register(
        mut self,
        publisher: impl Into<String>,
        handler: Arc<dyn NotifyCallback>,
    ) -> Result<Self, RegistryError> {
        let publisher = publisher.into();
        if publisher.is_empty() {
            return Err(RegistryError::EmptyPublisher);
        }
        if self.handlers.contains_key(&publisher) {
            return Err(RegistryError::DuplicatePublisher(publisher));
        }
        self.handlers.insert(publisher, handler);
        Ok(self)
    }

    pub fn build(self) -> CallbackRegistry {
        info!(publishers = self.handlers.len(), "Callback registry built");
        CallbackRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

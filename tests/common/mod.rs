//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use rendezvous::registry::{CallbackError, NotifyCallback};
use rendezvous::{Payload, ResponseMap, WaitInstance};

/// One callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fired {
    Success {
        instance: Uuid,
        responses: ResponseMap,
    },
    Error {
        instance: Uuid,
        errors: ResponseMap,
    },
    Progress {
        instance: Uuid,
        correlation_id: String,
        progress: Payload,
    },
}

/// Callback that records every invocation.
#[derive(Default)]
pub struct RecordingCallback {
    fired: Mutex<Vec<Fired>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fired(&self) -> Vec<Fired> {
        self.fired.lock().await.clone()
    }

    /// Success and error completions for one instance.
    pub async fn completions(&self, instance: Uuid) -> Vec<Fired> {
        self.fired
            .lock()
            .await
            .iter()
            .filter(|f| match f {
                Fired::Success { instance: id, .. } | Fired::Error { instance: id, .. } => {
                    *id == instance
                }
                Fired::Progress { .. } => false,
            })
            .cloned()
            .collect()
    }

    pub async fn completion_count(&self) -> usize {
        self.fired
            .lock()
            .await
            .iter()
            .filter(|f| !matches!(f, Fired::Progress { .. }))
            .count()
    }
}

#[async_trait]
impl NotifyCallback for RecordingCallback {
    async fn notify(
        &self,
        instance: &WaitInstance,
        responses: ResponseMap,
    ) -> Result<(), CallbackError> {
        self.fired.lock().await.push(Fired::Success {
            instance: instance.id,
            responses,
        });
        Ok(())
    }

    async fn notify_error(
        &self,
        instance: &WaitInstance,
        errors: ResponseMap,
    ) -> Result<(), CallbackError> {
        self.fired.lock().await.push(Fired::Error {
            instance: instance.id,
            errors,
        });
        Ok(())
    }

    async fn notify_progress(
        &self,
        instance: &WaitInstance,
        correlation_id: &str,
        progress: &Payload,
    ) -> Result<(), CallbackError> {
        self.fired.lock().await.push(Fired::Progress {
            instance: instance.id,
            correlation_id: correlation_id.to_string(),
            progress: progress.clone(),
        });
        Ok(())
    }
}

/// Unique correlation id so tests sharing a store do not collide.
pub fn cid(tag: &str) -> String {
    format!("{}-{}", tag, Uuid::new_v4())
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Runtime wiring.
//!
//! Builds the store, channel, registry, consumer, reconciler and progress
//! dispatcher from configuration and runs them together.
//!
//! # Example
//!
//! ```ignore
//! let mut runtime = RuntimeBuilder::new()
//!     .with_memory_storage()
//!     .register("pipeline", Arc::new(PipelineCallback))?
//!     .build()
//!     .await?;
//! runtime.start().await?;
//!
//! let engine = runtime.engine();
//! engine.wait_for_all("pipeline", ["task-1", "task-2"]).await?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::bus::{init_event_channel, EventChannel, MessagingConfig};
use crate::config::Config;
use crate::registry::{CallbackRegistry, CallbackRegistryBuilder, NotifyCallback, RegistryError};
use crate::services::{
    EngineConfig, NotifyEventConsumer, ProgressConfig, ProgressDispatcher, ProgressHandle,
    Reconciler, ReconcilerConfig, ReconcilerHandle, WaitNotifyEngine,
};
use crate::storage::{init_storage, CorrelationStore, StorageConfig, StorageType};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Builder for a wait/notify runtime.
pub struct RuntimeBuilder {
    config: Config,
    registry: CallbackRegistryBuilder,
    /// Optional custom store (for testing or external backends).
    custom_store: Option<Arc<dyn CorrelationStore>>,
    /// Optional custom channel (for testing or external transports).
    custom_channel: Option<Arc<dyn EventChannel>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Create a builder with default configuration: SQLite at the default
    /// path and the in-process channel.
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            registry: CallbackRegistry::builder(),
            custom_store: None,
            custom_channel: None,
        }
    }

    /// Keep all state in process memory.
    pub fn with_memory_storage(mut self) -> Self {
        self.config.storage.storage_type = StorageType::Memory;
        self
    }

    /// Use a SQLite database file (or `:memory:`).
    pub fn with_sqlite_file(mut self, path: impl Into<String>) -> Self {
        self.config.storage.storage_type = StorageType::Sqlite;
        self.config.storage.sqlite.path = path.into();
        self
    }

    pub fn with_storage(mut self, config: StorageConfig) -> Self {
        self.config.storage = config;
        self
    }

    pub fn with_messaging(mut self, config: MessagingConfig) -> Self {
        self.config.messaging = config;
        self
    }

    pub fn with_engine(mut self, config: EngineConfig) -> Self {
        self.config.engine = config;
        self
    }

    pub fn with_reconciler(mut self, config: ReconcilerConfig) -> Self {
        self.config.reconciler = config;
        self
    }

    pub fn with_progress(mut self, config: ProgressConfig) -> Self {
        self.config.progress = config;
        self
    }

    /// Use a pre-built store instead of `storage` configuration.
    pub fn with_store(mut self, store: Arc<dyn CorrelationStore>) -> Self {
        self.custom_store = Some(store);
        self
    }

    /// Use a pre-built channel instead of `messaging` configuration.
    pub fn with_channel(mut self, channel: Arc<dyn EventChannel>) -> Self {
        self.custom_channel = Some(channel);
        self
    }

    /// Register the handler that completes waits for `publisher`.
    pub fn register(
        mut self,
        publisher: impl Into<String>,
        handler: Arc<dyn NotifyCallback>,
    ) -> Result<Self, RegistryError> {
        self.registry = self.registry.register(publisher, handler)?;
        Ok(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Construct every component. Nothing runs until `Runtime::start`.
    pub async fn build(self) -> Result<Runtime, BoxError> {
        self.config.validate()?;

        let store = match self.custom_store {
            Some(store) => store,
            None => init_storage(&self.config.storage).await?,
        };
        let channel = match self.custom_channel {
            Some(channel) => channel,
            None => init_event_channel(&self.config.messaging).await?,
        };
        let registry = self.registry.build();

        let engine = WaitNotifyEngine::new(
            store.clone(),
            channel.clone(),
            self.config.engine.clone(),
        );
        let consumer = NotifyEventConsumer::new(store.clone(), registry.clone());

        Ok(Runtime {
            config: self.config,
            store,
            channel,
            registry,
            engine,
            consumer,
            reconciler: None,
            progress: None,
        })
    }
}

/// A built runtime: engine for callers plus background tasks.
pub struct Runtime {
    config: Config,
    store: Arc<dyn CorrelationStore>,
    channel: Arc<dyn EventChannel>,
    registry: CallbackRegistry,
    engine: WaitNotifyEngine,
    consumer: NotifyEventConsumer,
    reconciler: Option<ReconcilerHandle>,
    progress: Option<ProgressHandle>,
}

impl Runtime {
    /// Subscribe the consumer and start the background tasks. Idempotent.
    pub async fn start(&mut self) -> Result<(), BoxError> {
        if self.reconciler.is_some() {
            return Ok(());
        }

        self.channel
            .subscribe(Arc::new(self.consumer.clone()))
            .await?;
        self.channel.start_consuming().await?;

        self.reconciler = Some(self.reconciler().spawn());

        if self.config.progress.enabled {
            let dispatcher = ProgressDispatcher::new(
                self.store.clone(),
                self.registry.clone(),
                self.config.progress.clone(),
            );
            self.progress = Some(dispatcher.spawn());
        }

        info!(
            publishers = ?self.registry.publishers(),
            "Runtime started"
        );
        Ok(())
    }

    /// The Notify API.
    pub fn engine(&self) -> WaitNotifyEngine {
        self.engine.clone()
    }

    pub fn store(&self) -> Arc<dyn CorrelationStore> {
        self.store.clone()
    }

    pub fn channel(&self) -> Arc<dyn EventChannel> {
        self.channel.clone()
    }

    pub fn consumer(&self) -> NotifyEventConsumer {
        self.consumer.clone()
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// A reconciler over this runtime's components, for manual passes.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.channel.clone(),
            self.consumer.clone(),
            self.config.reconciler.clone(),
        )
    }

    /// Stop background tasks and the channel workers.
    pub async fn shutdown(self) {
        if let Some(reconciler) = self.reconciler {
            reconciler.shutdown().await;
        }
        if let Some(progress) = self.progress {
            progress.shutdown().await;
        }
        self.channel.shutdown().await;
        info!("Runtime stopped");
    }

    /// Start if needed and run until Ctrl+C.
    pub async fn run(mut self) -> Result<(), BoxError> {
        self.start().await?;
        info!("Runtime running, press Ctrl+C to exit");

        tokio::signal::ctrl_c().await?;

        info!("Shutting down runtime");
        self.shutdown().await;
        Ok(())
    }
}

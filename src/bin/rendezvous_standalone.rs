//! rendezvous-standalone: single-process wait/notify host
//!
//! Opens the correlation store, starts the in-process event channel with
//! its consumers, and runs the reconciler and progress dispatcher until
//! Ctrl+C.
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   type: sqlite
//!   sqlite:
//!     path: data/rendezvous.db
//!
//! messaging:
//!   type: channel
//!   channel:
//!     workers: 4
//!
//! engine:
//!   response_ttl_secs: 300
//!
//! reconciler:
//!   interval_secs: 5
//!   page_size: 100
//! ```
//!
//! The file is chosen with `--config <path>` or `RENDEZVOUS_CONFIG`.
//! Every setting can be overridden with `RENDEZVOUS__SECTION__KEY`.
//! Log filtering uses `RENDEZVOUS_LOG`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use clap::Parser;
use tracing::{error, info, warn};

use rendezvous::config::Config;
use rendezvous::registry::{CallbackError, NotifyCallback};
use rendezvous::storage::init_storage;
use rendezvous::utils::bootstrap::init_tracing;
use rendezvous::utils::retry::connection_backoff;
use rendezvous::{Payload, ResponseMap, RuntimeBuilder, WaitInstance};

/// Publisher name served by the standalone host.
const LOG_PUBLISHER: &str = "log";

#[derive(Parser, Debug)]
#[command(name = "rendezvous-standalone", version, about = "Single-process wait/notify host")]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, env = "RENDEZVOUS_CONFIG")]
    config: Option<String>,
}

/// Logs completed joins. Embedding applications register their own
/// handlers through `RuntimeBuilder::register`.
struct LoggingCallback;

#[async_trait]
impl NotifyCallback for LoggingCallback {
    async fn notify(
        &self,
        instance: &WaitInstance,
        responses: ResponseMap,
    ) -> Result<(), CallbackError> {
        info!(
            wait_instance_id = %instance.id,
            responses = ?responses.keys().collect::<Vec<_>>(),
            "Wait completed"
        );
        Ok(())
    }

    async fn notify_error(
        &self,
        instance: &WaitInstance,
        errors: ResponseMap,
    ) -> Result<(), CallbackError> {
        warn!(
            wait_instance_id = %instance.id,
            errors = ?errors.keys().collect::<Vec<_>>(),
            "Wait completed with errors"
        );
        Ok(())
    }

    async fn notify_progress(
        &self,
        instance: &WaitInstance,
        correlation_id: &str,
        progress: &Payload,
    ) -> Result<(), CallbackError> {
        info!(
            wait_instance_id = %instance.id,
            correlation_id = %correlation_id,
            progress = %progress,
            "Progress"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing();

    let config = Config::load(args.config.as_deref())?;

    info!(
        storage = ?config.storage.storage_type,
        messaging = ?config.messaging.messaging_type,
        "Starting rendezvous-standalone"
    );

    let store = (|| async { init_storage(&config.storage).await })
        .retry(connection_backoff())
        .notify(|err, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Storage not ready, retrying");
        })
        .await
        .inspect_err(|e| error!(error = %e, "Failed to open correlation store"))?;

    let runtime = RuntimeBuilder::from_config(config)
        .with_store(store)
        .register(LOG_PUBLISHER, Arc::new(LoggingCallback))?
        .build()
        .await?;

    runtime.run().await
}

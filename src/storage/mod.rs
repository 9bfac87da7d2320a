//! Correlation storage.
//!
//! This module contains:
//! - `CorrelationStore` trait: persistence for wait instances, queue rows,
//!   responses and progress updates
//! - Storage configuration types
//! - Implementations: Mock (in-memory), SQLite

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

pub mod correlation_store;
pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use correlation_store::{CorrelationStore, RecordOutcome};
pub use mock::MockCorrelationStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCorrelationStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Wait instance {0} has no correlation ids")]
    EmptyCorrelationIds(Uuid),

    #[error("Wait instance already exists: {0}")]
    DuplicateWaitInstance(Uuid),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-process maps. State is lost on restart.
    Memory,
    /// SQLite file or in-memory database.
    #[default]
    Sqlite,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database path, or `:memory:`.
    pub path: String,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "data/rendezvous.db".to_string(),
            max_connections: 5,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize storage based on configuration.
///
/// Requires the corresponding feature for non-memory backends:
/// - SQLite: `--features sqlite` (included in default)
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn CorrelationStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Correlation store initialized");
            Ok(Arc::new(MockCorrelationStore::new()))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let store = SqliteCorrelationStore::connect(&config.sqlite).await?;
                info!(
                    storage_type = "sqlite",
                    path = %config.sqlite.path,
                    "Correlation store initialized"
                );
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite"
                    .into())
            }
        }
    }
}

//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::bus::BusError;
use crate::storage::StorageError;

/// Backoff for publishing a notify event after the response is durable.
///
/// Short and bounded: a publish that still fails is repaired by the
/// reconciler, so the caller should not wait long.
///
/// - Min delay: 10ms
/// - Max delay: 500ms
/// - Max attempts: 5
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for opening the store at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Whether a publish error may succeed on retry.
///
/// A closed channel or a channel that cannot accept publishes at all will
/// not recover by waiting.
pub fn is_retryable_bus_error(error: &BusError) -> bool {
    matches!(
        error,
        BusError::Connection(_) | BusError::Publish(_) | BusError::HandlerFailed { .. }
    )
}

/// Whether a storage error is transient.
pub fn is_retryable_storage_error(error: &StorageError) -> bool {
    match error {
        StorageError::Unavailable(_) => true,
        #[cfg(feature = "sqlite")]
        StorageError::Database(e) => matches!(
            e,
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Database(_)
        ),
        _ => false,
    }
}

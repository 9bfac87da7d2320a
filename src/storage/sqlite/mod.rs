//! SQLite implementations of storage interfaces.

mod correlation_store;

pub use correlation_store::SqliteCorrelationStore;

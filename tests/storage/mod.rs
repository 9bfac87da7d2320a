//! Shared storage integration tests.
//!
//! Tests the CorrelationStore interface against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod correlation_store_tests;

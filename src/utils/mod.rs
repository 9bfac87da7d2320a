//! Utility functions.
//!
//! These are stateless helpers used across the codebase.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod pagination;
pub mod retry;

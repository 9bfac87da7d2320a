//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("rendezvous"));

// ============================================================================
// Notify API
// ============================================================================

/// Wait instances registered.
pub static WAIT_REGISTERED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.wait.registered")
        .with_description("Wait instances registered")
        .build()
});

/// Responses recorded, by outcome (recorded, duplicate).
pub static NOTIFY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.notify.total")
        .with_description("Notify calls by outcome")
        .build()
});

/// Publishes that failed after retries and were left to the reconciler.
pub static PUBLISH_DEFERRED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.publish.deferred")
        .with_description("Notify events left for the reconciler after publish failure")
        .build()
});

// ============================================================================
// Consumer
// ============================================================================

/// Wait instances completed, by outcome (success, error, unregistered).
pub static COMPLETION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.completion.total")
        .with_description("Wait instances completed")
        .build()
});

/// Time from registration to callback dispatch.
pub static COMPLETION_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("rendezvous.completion.latency")
        .with_description("Time from wait registration to completion")
        .with_unit("s")
        .build()
});

/// Completions whose publisher name had no registered handler.
pub static CALLBACK_UNREGISTERED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.callback.unregistered")
        .with_description("Completions with no registered handler for the publisher")
        .build()
});

// ============================================================================
// Reconciler
// ============================================================================

/// Events republished by the missed-event sweep.
pub static RECONCILER_REPUBLISHED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.reconciler.republished")
        .with_description("Notify events republished by the reconciler")
        .build()
});

/// Orphan responses deleted by the TTL sweep.
pub static RECONCILER_ORPHANS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.reconciler.orphans_deleted")
        .with_description("Orphan responses deleted")
        .build()
});

/// Partially registered instances removed without firing.
pub static RECONCILER_PHANTOMS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rendezvous.reconciler.phantoms_removed")
        .with_description("Wait instances removed because some ids were never registered")
        .build()
});

/// Duration of a full reconciler pass.
pub static RECONCILER_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("rendezvous.reconciler.duration")
        .with_description("Reconciler pass duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Attribute helpers
// ============================================================================

pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

pub fn publisher_attr(publisher: &str) -> KeyValue {
    KeyValue::new("publisher", publisher.to_string())
}

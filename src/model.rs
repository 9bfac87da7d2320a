//! Durable record shapes owned by the correlation store.
//!
//! Three record kinds model the join:
//! - `WaitInstance`: one registered join with its publisher key
//! - `WaitQueue`: one outstanding (instance, correlation id) pair
//! - `NotifyResponse`: the result of one async operation, keyed by correlation id
//!
//! `ProgressUpdate` carries best-effort intermediate data for running operations.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque response/progress payload.
pub type Payload = serde_json::Value;

/// Responses handed to a callback, keyed by correlation id.
pub type ResponseMap = BTreeMap<String, Payload>;

/// A registered join over a fixed set of correlation ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub id: Uuid,
    /// Selects the callback registry entry that completes this instance.
    pub publisher: String,
    /// Ordered, de-duplicated, never empty. Fixed for the instance's lifetime.
    pub correlation_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl WaitInstance {
    /// Build a new instance, dropping repeated correlation ids while keeping
    /// first-seen order.
    pub fn new<I, S>(publisher: impl Into<String>, correlation_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = Vec::new();
        for id in correlation_ids {
            let id = id.into();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        Self {
            id: Uuid::new_v4(),
            publisher: publisher.into(),
            correlation_ids: ids,
            created_at: Utc::now(),
        }
    }

    /// One queue row per correlation id, sharing the instance's creation time.
    pub fn queue_rows(&self) -> Vec<WaitQueue> {
        self.correlation_ids
            .iter()
            .map(|correlation_id| WaitQueue {
                id: Uuid::new_v4(),
                wait_instance_id: self.id,
                correlation_id: correlation_id.clone(),
                created_at: self.created_at,
            })
            .collect()
    }
}

/// One outstanding (WaitInstance, correlation id) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitQueue {
    pub id: Uuid,
    pub wait_instance_id: Uuid,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

impl WaitQueue {
    /// Scan order key: creation time, then id as a stable tiebreak.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Latest `valid_until` a response can carry. Later instants would not
/// render as four-digit-year RFC3339 text.
fn max_valid_until() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable result of a completed async operation.
///
/// The correlation id is the record id: at most one response per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub correlation_id: String,
    pub payload: Payload,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl NotifyResponse {
    pub fn new(
        correlation_id: impl Into<String>,
        payload: Payload,
        is_error: bool,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        // Oversized TTLs saturate instead of expiring immediately.
        let valid_until = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .map_or_else(max_valid_until, |t| t.min(max_valid_until()));
        Self {
            correlation_id: correlation_id.into(),
            payload,
            is_error,
            created_at,
            valid_until,
        }
    }

    /// True once the TTL marker has passed.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }
}

/// Intermediate progress reported for a running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: Uuid,
    pub correlation_id: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(correlation_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

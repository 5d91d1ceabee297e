use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable per-call bookkeeping: what the Aggregator last saw and last shipped for a
/// `linkedid`. This is the system's sole retry queue — a failed shipment is retried by the
/// next aggregation pass that notices `error_count > 0`, not by a separate dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingState {
    pub linkedid: String,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub is_complete: bool,
    pub last_cdr_count: i64,
    pub last_cel_count: i64,
    pub shipped_at: Option<DateTime<Utc>>,
    pub ship_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
}

impl ShippingState {
    pub fn new(linkedid: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            linkedid: linkedid.into(),
            first_seen: now,
            last_updated: now,
            is_complete: false,
            last_cdr_count: 0,
            last_cel_count: 0,
            shipped_at: None,
            ship_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn has_grown(&self, cdr_count: usize, cel_count: usize) -> bool {
        cdr_count as i64 > self.last_cdr_count || cel_count as i64 > self.last_cel_count
    }

    pub fn is_purgeable(&self, now: DateTime<Utc>) -> bool {
        self.shipped_at.is_some() && now - self.last_updated >= chrono::Duration::hours(48)
    }

    /// Once a call has shipped in the `complete` phase it is never reshipped, even across a
    /// restart, as long as this state row survives the 48h purge.
    pub fn already_shipped_complete(&self) -> bool {
        self.is_complete && self.shipped_at.is_some()
    }
}

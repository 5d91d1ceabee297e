use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShipPhase {
    Initial,
    Update,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallThreadEntry {
    pub time: DateTime<Utc>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// The document shipped to the ingestion API for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedCallDocument {
    pub linkedid: String,
    pub is_complete: bool,
    pub call_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub direction: Direction,
    pub disposition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub hostname: String,
    pub connector: String,
    pub connector_version: String,
    pub customer_id: Option<i64>,
    pub call_threads: Vec<CallThreadEntry>,
    pub call_threads_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_files: Option<Vec<String>>,
    pub ship_phase: ShipPhase,
    pub shipped_at: DateTime<Utc>,
}

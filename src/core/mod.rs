//! Top-level orchestrator: owns configuration, the Local State Store, the Source Readers, the
//! Aggregator, the Recording Tracker, the Shipper, and the metrics/health endpoint, and
//! sequences their startup and shutdown.

pub mod gateway;

pub use gateway::{Agent, AgentEvent, AgentStatus};

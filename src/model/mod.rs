//! Shared data types flowing between sources, the aggregator, and the shipper.

pub mod cdr;
pub mod cel;
pub mod call_group;
pub mod document;
pub mod recording;
pub mod shipping_state;

pub use cdr::Cdr;
pub use cel::{Cel, CelEventType};
pub use call_group::CallGroup;
pub use document::{CallThreadEntry, ConsolidatedCallDocument, ShipPhase};
pub use recording::RecordingDescriptor;
pub use shipping_state::ShippingState;

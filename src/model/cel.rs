use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel event log entry: one row per channel-lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cel {
    pub eventtime: DateTime<Utc>,
    pub eventtype: CelEventType,
    pub cid_name: String,
    pub cid_num: String,
    pub cid_dnid: String,
    pub exten: String,
    pub context: String,
    pub channame: String,
    pub appname: String,
    pub appdata: String,
    pub uniqueid: String,
    pub linkedid: String,
    pub peer: String,
    pub extra: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CelEventType {
    ChanStart,
    ChanEnd,
    Answer,
    Hangup,
    BridgeEnter,
    BridgeExit,
    AppStart,
    AppEnd,
    LinkedidEnd,
    DtmfBegin,
    DtmfEnd,
    BlindTransfer,
    AttendedTransfer,
    Other(String),
}

impl CelEventType {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "CHAN_START" => Self::ChanStart,
            "CHAN_END" => Self::ChanEnd,
            "ANSWER" => Self::Answer,
            "HANGUP" => Self::Hangup,
            "BRIDGE_ENTER" => Self::BridgeEnter,
            "BRIDGE_EXIT" => Self::BridgeExit,
            "APP_START" => Self::AppStart,
            "APP_END" => Self::AppEnd,
            "LINKEDID_END" => Self::LinkedidEnd,
            "DTMF_BEGIN" => Self::DtmfBegin,
            "DTMF_END" => Self::DtmfEnd,
            "BLINDTRANSFER" => Self::BlindTransfer,
            "ATTENDEDTRANSFER" => Self::AttendedTransfer,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ChanStart => "CHAN_START",
            Self::ChanEnd => "CHAN_END",
            Self::Answer => "ANSWER",
            Self::Hangup => "HANGUP",
            Self::BridgeEnter => "BRIDGE_ENTER",
            Self::BridgeExit => "BRIDGE_EXIT",
            Self::AppStart => "APP_START",
            Self::AppEnd => "APP_END",
            Self::LinkedidEnd => "LINKEDID_END",
            Self::DtmfBegin => "DTMF_BEGIN",
            Self::DtmfEnd => "DTMF_END",
            Self::BlindTransfer => "BLINDTRANSFER",
            Self::AttendedTransfer => "ATTENDEDTRANSFER",
            Self::Other(s) => s.as_str(),
        }
    }

    /// The allowlist of event types merged into a call's thread timeline, in priority order
    /// for tie-breaking equal timestamps.
    pub const THREAD_ALLOWLIST: &'static [CelEventTypeTag] = &[
        CelEventTypeTag::ChanStart,
        CelEventTypeTag::Answer,
        CelEventTypeTag::BridgeEnter,
        CelEventTypeTag::BridgeExit,
        CelEventTypeTag::BlindTransfer,
        CelEventTypeTag::AttendedTransfer,
        CelEventTypeTag::Hangup,
        CelEventTypeTag::LinkedidEnd,
    ];

    pub fn allowlist_rank(&self) -> Option<usize> {
        let tag = match self {
            Self::ChanStart => CelEventTypeTag::ChanStart,
            Self::Answer => CelEventTypeTag::Answer,
            Self::BridgeEnter => CelEventTypeTag::BridgeEnter,
            Self::BridgeExit => CelEventTypeTag::BridgeExit,
            Self::BlindTransfer => CelEventTypeTag::BlindTransfer,
            Self::AttendedTransfer => CelEventTypeTag::AttendedTransfer,
            Self::Hangup => CelEventTypeTag::Hangup,
            Self::LinkedidEnd => CelEventTypeTag::LinkedidEnd,
            _ => return None,
        };
        Self::THREAD_ALLOWLIST.iter().position(|t| *t == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CelEventTypeTag {
    ChanStart,
    Answer,
    BridgeEnter,
    BridgeExit,
    BlindTransfer,
    AttendedTransfer,
    Hangup,
    LinkedidEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_types_are_preserved_as_other() {
        assert_eq!(CelEventType::from_raw("PICKUP"), CelEventType::Other("PICKUP".into()));
    }

    #[test]
    fn allowlist_rank_orders_by_priority() {
        assert!(CelEventType::ChanStart.allowlist_rank() < CelEventType::Hangup.allowlist_rank());
        assert_eq!(CelEventType::DtmfBegin.allowlist_rank(), None);
    }
}

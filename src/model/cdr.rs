use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One billable call leg, as read from the switch's CDR table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cdr {
    pub calldate: DateTime<Utc>,
    pub src: String,
    pub dst: String,
    pub context: String,
    pub dcontext: String,
    pub channel: String,
    pub dstchannel: String,
    pub disposition: Disposition,
    pub duration: i64,
    pub billsec: i64,
    pub uniqueid: String,
    pub linkedid: String,
    pub accountcode: String,
    pub amaflags: i32,
    pub lastapp: String,
    pub lastdata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Disposition {
    Answered,
    #[serde(rename = "NO ANSWER")]
    NoAnswer,
    Busy,
    Failed,
    Congestion,
    Null,
}

impl Disposition {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "ANSWERED" => Self::Answered,
            "NO ANSWER" => Self::NoAnswer,
            "BUSY" => Self::Busy,
            "FAILED" => Self::Failed,
            "CONGESTION" => Self::Congestion,
            _ => Self::Null,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Null)
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Answered => "ANSWERED",
            Self::NoAnswer => "NO ANSWER",
            Self::Busy => "BUSY",
            Self::Failed => "FAILED",
            Self::Congestion => "CONGESTION",
            Self::Null => "NULL",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_parses_case_insensitively() {
        assert_eq!(Disposition::from_raw("answered"), Disposition::Answered);
        assert_eq!(Disposition::from_raw("No Answer"), Disposition::NoAnswer);
        assert_eq!(Disposition::from_raw("garbage"), Disposition::Null);
    }

    #[test]
    fn only_terminal_dispositions_are_terminal() {
        assert!(Disposition::Answered.is_terminal());
        assert!(Disposition::Failed.is_terminal());
        assert!(!Disposition::Null.is_terminal());
    }
}

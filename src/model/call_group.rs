use chrono::{DateTime, Utc};

use super::{Cdr, Cel, CelEventType};

/// The set of CDRs and CELs sharing one `linkedid`, in memory, before it becomes
/// a consolidated document.
#[derive(Debug, Clone, Default)]
pub struct CallGroup {
    pub linkedid: String,
    pub cdrs: Vec<Cdr>,
    pub cels: Vec<Cel>,
}

impl CallGroup {
    pub fn new(linkedid: impl Into<String>) -> Self {
        Self {
            linkedid: linkedid.into(),
            cdrs: Vec::new(),
            cels: Vec::new(),
        }
    }

    pub fn calldate(&self) -> Option<DateTime<Utc>> {
        self.cdrs.iter().map(|c| c.calldate).min()
    }

    pub fn duration_seconds(&self) -> i64 {
        self.cdrs.iter().map(|c| c.duration).max().unwrap_or(0)
    }

    pub fn has_linkedid_end(&self) -> bool {
        self.cels
            .iter()
            .any(|c| matches!(c.eventtype, CelEventType::LinkedidEnd))
    }

    /// Completion per the three-rule test: an explicit LINKEDID_END, a hangup count matching
    /// the distinct channel count, or all dispositions final with no recent activity.
    pub fn is_complete(&self, now: DateTime<Utc>, quiescence: chrono::Duration) -> bool {
        if self.has_linkedid_end() {
            return true;
        }

        let distinct_chan_starts: std::collections::HashSet<&str> = self
            .cels
            .iter()
            .filter(|c| matches!(c.eventtype, CelEventType::ChanStart))
            .map(|c| c.channame.as_str())
            .collect();
        let hangup_count = self
            .cels
            .iter()
            .filter(|c| matches!(c.eventtype, CelEventType::Hangup))
            .count();
        if !distinct_chan_starts.is_empty() && hangup_count == distinct_chan_starts.len() {
            return true;
        }

        if self.cdrs.is_empty() {
            return false;
        }
        let all_dispositions_final = self.cdrs.iter().all(|c| c.disposition.is_terminal());
        if !all_dispositions_final {
            return false;
        }
        self.last_activity()
            .map(|last| now - last >= quiescence)
            .unwrap_or(false)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let last_cdr = self.cdrs.iter().map(|c| c.calldate).max();
        let last_cel = self.cels.iter().map(|c| c.eventtime).max();
        match (last_cdr, last_cel) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub fn cdr_count(&self) -> usize {
        self.cdrs.len()
    }

    pub fn cel_count(&self) -> usize {
        self.cels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cdr::Disposition;
    use chrono::Duration;

    fn cdr(calldate: DateTime<Utc>, disposition: Disposition, duration: i64) -> Cdr {
        Cdr {
            calldate,
            src: "100".into(),
            dst: "200".into(),
            context: "from-internal".into(),
            dcontext: "from-internal".into(),
            channel: "PJSIP/100-1".into(),
            dstchannel: "PJSIP/200-2".into(),
            disposition,
            duration,
            billsec: duration,
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            accountcode: "".into(),
            amaflags: 3,
            lastapp: "Dial".into(),
            lastdata: "".into(),
        }
    }

    #[test]
    fn empty_group_is_never_complete() {
        let group = CallGroup::new("1.1");
        assert!(!group.is_complete(Utc::now(), Duration::seconds(60)));
    }

    #[test]
    fn linkedid_end_forces_completion() {
        let mut group = CallGroup::new("1.1");
        group.cdrs.push(cdr(Utc::now(), Disposition::Null, 0));
        group.cels.push(Cel {
            eventtime: Utc::now(),
            eventtype: CelEventType::LinkedidEnd,
            cid_name: "".into(),
            cid_num: "".into(),
            cid_dnid: "".into(),
            exten: "".into(),
            context: "".into(),
            channame: "".into(),
            appname: "".into(),
            appdata: "".into(),
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            peer: "".into(),
            extra: "".into(),
        });
        assert!(group.is_complete(Utc::now(), Duration::seconds(60)));
    }

    #[test]
    fn stale_final_dispositions_complete_after_quiescence() {
        let mut group = CallGroup::new("1.1");
        let old = Utc::now() - Duration::seconds(120);
        group.cdrs.push(cdr(old, Disposition::Answered, 30));
        assert!(group.is_complete(Utc::now(), Duration::seconds(60)));
    }

    #[test]
    fn recent_final_dispositions_are_not_yet_complete() {
        let mut group = CallGroup::new("1.1");
        group.cdrs.push(cdr(Utc::now(), Disposition::Answered, 30));
        assert!(!group.is_complete(Utc::now(), Duration::seconds(60)));
    }
}

//! Builds a `ConsolidatedCallDocument` from a `CallGroup`: direction/identity/tenant inference
//! plus the time-ordered merge of CDR and allowlisted CEL rows into `call_threads`.

use chrono::Utc;
use serde_json::json;

use crate::config::{AgentConfig, TenantConfig};
use crate::inference::{self, CallIdentity, Direction};
use crate::model::{CallGroup, CallThreadEntry, Cdr, Cel, CelEventType, ConsolidatedCallDocument, ShipPhase};

use crate::inference::patterns::PSEUDO_DESTINATIONS;

/// The CDR carrying the call's canonical direction/identity signal: the one with the earliest
/// `calldate`, since later legs (transfers, forwards) can rewrite `src`/`dst` in ways that no
/// longer reflect how the call originated.
fn primary_cdr(cdrs: &[Cdr]) -> Option<&Cdr> {
    cdrs.iter().min_by_key(|c| c.calldate)
}

/// When `dst` is a pseudo-destination (`s`, `h`, `i`, `t`), the dialed DID is recovered from the
/// first CEL `CHAN_START` whose `exten` is 10+ digits.
fn recover_did_from_cel(cels: &[Cel]) -> Option<String> {
    cels.iter()
        .filter(|c| matches!(c.eventtype, CelEventType::ChanStart))
        .find(|c| c.exten.chars().filter(|ch| ch.is_ascii_digit()).count() >= 10)
        .map(|c| c.exten.clone())
}

pub fn build_identity(cdr: &Cdr, cels: &[Cel], tenant_config: &TenantConfig) -> CallIdentity {
    let result = inference::classify_direction(cdr, tenant_config);
    let assume_na = true;

    let mut identity = CallIdentity {
        direction: Some(result.direction),
        likely_forwarded: result.likely_forwarded,
        ..Default::default()
    };

    if !inference::numbers::is_anonymous_callerid(&cdr.src) {
        identity.src_number = Some(inference::normalize_number(&cdr.src, assume_na));
    }
    if inference::is_extension(&cdr.src, tenant_config.extension_min_digits, tenant_config.extension_max_digits) {
        identity.src_extension = Some(cdr.src.clone());
    }

    if PSEUDO_DESTINATIONS.contains(&cdr.dst.as_str()) {
        identity.dst_number = recover_did_from_cel(cels).map(|d| inference::normalize_number(&d, assume_na));
    } else {
        if inference::is_extension(&cdr.dst, tenant_config.extension_min_digits, tenant_config.extension_max_digits) {
            identity.dst_extension = Some(cdr.dst.clone());
        } else {
            identity.dst_number = Some(inference::normalize_number(&cdr.dst, assume_na));
        }
    }

    identity.tenant = inference::extract_tenant(cdr, cels, tenant_config);

    let names = inference::extract_names(cels, identity.src_number.as_deref(), identity.dst_extension.as_deref());
    identity.src_name = names.src_name;
    identity.dst_name = names.dst_name;

    identity
}

/// Time-ordered merge of projected CDR rows (tag `CDR`) and CEL rows restricted to the
/// thread allowlist. Ties on equal timestamps: CDR before CEL; among CELs, allowlist order.
pub fn merge_call_threads(cdrs: &[Cdr], cels: &[Cel]) -> Vec<CallThreadEntry> {
    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Kind {
        Cdr,
        Cel(usize),
    }

    let mut entries: Vec<(chrono::DateTime<Utc>, Kind, CallThreadEntry)> = Vec::new();

    for cdr in cdrs {
        entries.push((
            cdr.calldate,
            Kind::Cdr,
            CallThreadEntry {
                time: cdr.calldate,
                event: "CDR".to_string(),
                detail: Some(json!({
                    "disposition": cdr.disposition.to_string(),
                    "channel": cdr.channel,
                    "dstchannel": cdr.dstchannel,
                    "duration": cdr.duration,
                    "billsec": cdr.billsec,
                    "lastapp": cdr.lastapp,
                })),
            },
        ));
    }

    for cel in cels {
        if let Some(rank) = cel.eventtype.allowlist_rank() {
            entries.push((
                cel.eventtime,
                Kind::Cel(rank),
                CallThreadEntry {
                    time: cel.eventtime,
                    event: cel.eventtype.as_str().to_string(),
                    detail: Some(json!({
                        "channame": cel.channame,
                        "exten": cel.exten,
                        "cid_num": cel.cid_num,
                        "appname": cel.appname,
                    })),
                },
            ));
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    entries.into_iter().map(|(_, _, e)| e).collect()
}

pub fn build_document(
    group: &CallGroup,
    config: &AgentConfig,
    is_complete: bool,
    ship_phase: ShipPhase,
    recording_files: Option<Vec<String>>,
    now: chrono::DateTime<Utc>,
) -> Option<ConsolidatedCallDocument> {
    let primary = primary_cdr(&group.cdrs)?;
    let identity = build_identity(primary, &group.cels, &config.tenant);
    let threads = merge_call_threads(&group.cdrs, &group.cels);

    let disposition = group
        .cdrs
        .iter()
        .find(|c| c.disposition.is_terminal())
        .map(|c| c.disposition.to_string())
        .unwrap_or_else(|| primary.disposition.to_string());

    Some(ConsolidatedCallDocument {
        linkedid: group.linkedid.clone(),
        is_complete,
        call_time: group.calldate().unwrap_or(now),
        duration_seconds: group.duration_seconds(),
        direction: identity.direction.unwrap_or(Direction::Inbound),
        disposition,
        src_number: identity.src_number,
        src_extension: identity.src_extension,
        src_name: identity.src_name,
        dst_number: identity.dst_number,
        dst_extension: identity.dst_extension,
        dst_name: identity.dst_name,
        tenant: identity.tenant.or_else(|| config.general.default_tenant.clone()),
        hostname: config.hostname(),
        connector: "asterisk".to_string(),
        connector_version: config.general.connector_version.clone(),
        customer_id: config.general.customer_id,
        call_threads_count: threads.len(),
        call_threads: threads,
        recording_files,
        ship_phase,
        shipped_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cdr::Disposition;
    use chrono::Utc;

    fn tenant() -> TenantConfig {
        let mut t = TenantConfig::default().with_defaults();
        t.known_trunks = vec![];
        t
    }

    fn cdr(src: &str, dst: &str) -> Cdr {
        Cdr {
            calldate: Utc::now(),
            src: src.into(),
            dst: dst.into(),
            context: "from-trunk".into(),
            dcontext: "from-did-direct-4164775498-telair".into(),
            channel: "SIP/sbc-ca2-telair-abc123".into(),
            dstchannel: "PJSIP/100-telair-def456".into(),
            disposition: Disposition::Answered,
            duration: 42,
            billsec: 42,
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            accountcode: String::new(),
            amaflags: 3,
            lastapp: "Dial".into(),
            lastdata: String::new(),
        }
    }

    #[test]
    fn pseudo_destination_recovers_did_from_cel() {
        let c = cdr("4165551234", "s");
        let cel = Cel {
            eventtime: Utc::now(),
            eventtype: CelEventType::ChanStart,
            cid_name: String::new(),
            cid_num: String::new(),
            cid_dnid: String::new(),
            exten: "4164775498".into(),
            context: String::new(),
            channame: String::new(),
            appname: String::new(),
            appdata: String::new(),
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            peer: String::new(),
            extra: String::new(),
        };
        let identity = build_identity(&c, &[cel], &tenant());
        assert_eq!(identity.dst_number.as_deref(), Some("14164775498"));
    }

    #[test]
    fn no_cel_match_leaves_dst_number_null() {
        let c = cdr("4165551234", "s");
        let identity = build_identity(&c, &[], &tenant());
        assert!(identity.dst_number.is_none());
        assert_eq!(identity.direction, Some(Direction::Inbound));
    }

    #[test]
    fn call_threads_sort_cdr_before_cel_on_equal_timestamp() {
        let when = Utc::now();
        let mut c = cdr("200", "201");
        c.calldate = when;
        let cel = Cel {
            eventtime: when,
            eventtype: CelEventType::Answer,
            cid_name: String::new(),
            cid_num: String::new(),
            cid_dnid: String::new(),
            exten: String::new(),
            context: String::new(),
            channame: String::new(),
            appname: String::new(),
            appdata: String::new(),
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            peer: String::new(),
            extra: String::new(),
        };
        let threads = merge_call_threads(&[c], &[cel]);
        assert_eq!(threads[0].event, "CDR");
        assert_eq!(threads[1].event, "ANSWER");
    }
}

//! Tenant-label extraction from dialplan context and channel-name strings.

use crate::config::TenantConfig;
use crate::model::{Cdr, Cel};

use super::patterns::{
    CHANNEL_UNIQUE_SUFFIX, DCONTEXT_TENANT_PATTERNS, EXTRA_TENANT_KV, PURELY_HEX, PURELY_NUMERIC, TENANT_SKIP_SET,
    TENANT_SKIP_SUBSTRINGS,
};

/// `check_substrings` applies the §4.3 rule-2 substring-contains rejection (`sbc`, `trunk`,
/// `peer`, `server`, `gw`, `gateway`, `pstn`), used for `dstchannel`/`channel`/CEL
/// `channame`/`peer` candidates but not for context-pattern candidates.
fn is_rejected(token: &str, known_trunks: &[String], check_substrings: bool) -> bool {
    if token.len() < 3 {
        return true;
    }
    let lowered = token.to_lowercase();
    if PURELY_NUMERIC.is_match(token) {
        return true;
    }
    if PURELY_HEX.is_match(token) && token.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    if TENANT_SKIP_SET.contains(&lowered.as_str()) {
        return true;
    }
    if check_substrings && TENANT_SKIP_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
        return true;
    }
    known_trunks.iter().any(|t| t.to_lowercase() == lowered)
}

/// Splits a channel/context string on `/` and `-`, strips the trailing hex unique suffix, and
/// returns the rightmost token that survives the rejection filters. `check_substrings` is `true`
/// for `dstchannel`/`channel`/`channame`/`peer` candidates (§4.3 rule 2/4) and `false` for
/// context candidates, which only use the exact skip-set.
fn rightmost_valid_token(raw: &str, known_trunks: &[String], check_substrings: bool) -> Option<String> {
    let without_suffix = CHANNEL_UNIQUE_SUFFIX.replace(raw, "");
    let parts: Vec<&str> = without_suffix
        .split(|c| c == '/' || c == '-')
        .filter(|s| !s.is_empty())
        .collect();
    parts
        .into_iter()
        .rev()
        .find(|tok| !is_rejected(tok, known_trunks, check_substrings))
        .map(|s| s.to_string())
}

fn from_dcontext(dcontext: &str) -> Option<String> {
    for pattern in DCONTEXT_TENANT_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(dcontext) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str().to_string());
            }
        }
    }
    None
}

fn from_extra(extra: &str) -> Option<String> {
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(extra) {
        if let Some(t) = parsed.get("tenant").and_then(|v| v.as_str()) {
            return Some(t.to_string());
        }
    }
    EXTRA_TENANT_KV.captures(extra).map(|c| c[1].to_string())
}

/// CDR-side extraction: `dcontext` regex bank, then `dstchannel`, then `context`, then `channel`,
/// each filtered by the shared rejection rules.
fn extract_tenant_cdr(cdr: &Cdr, known_trunks: &[String]) -> Option<String> {
    if let Some(t) = from_dcontext(&cdr.dcontext) {
        if !is_rejected(&t, known_trunks, false) {
            return Some(t);
        }
    }
    if let Some(t) = rightmost_valid_token(&cdr.dstchannel, known_trunks, true) {
        return Some(t);
    }
    if let Some(t) = rightmost_valid_token(&cdr.context, known_trunks, false) {
        return Some(t);
    }
    if let Some(t) = rightmost_valid_token(&cdr.channel, known_trunks, true) {
        return Some(t);
    }
    None
}

/// CEL-side extraction: `context`, then `channame`, then `peer`, then `extra` (JSON `tenant` key,
/// falling back to a `tenant=<value>` match), scanned across every CEL in arrival order.
fn extract_tenant_cel(cels: &[Cel], known_trunks: &[String]) -> Option<String> {
    for cel in cels {
        if let Some(t) = rightmost_valid_token(&cel.context, known_trunks, false) {
            return Some(t);
        }
    }
    for cel in cels {
        if let Some(t) = rightmost_valid_token(&cel.channame, known_trunks, true) {
            return Some(t);
        }
    }
    for cel in cels {
        if let Some(t) = rightmost_valid_token(&cel.peer, known_trunks, true) {
            return Some(t);
        }
    }
    for cel in cels {
        if let Some(t) = from_extra(&cel.extra) {
            if !is_rejected(&t, known_trunks, false) {
                return Some(t);
            }
        }
    }
    None
}

/// Extracts a tenant label independently from the CDR side and the CEL side of a call, then
/// merges: agreement (including both absent) keeps that value, a single side wins outright, and
/// a disagreement prefers the CDR-side value as the billing-grade signal, logging the mismatch.
pub fn extract_tenant(cdr: &Cdr, cels: &[Cel], config: &TenantConfig) -> Option<String> {
    let cdr_side = extract_tenant_cdr(cdr, &config.known_trunks);
    let cel_side = extract_tenant_cel(cels, &config.known_trunks);

    match (cdr_side, cel_side) {
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(a), Some(b)) => {
            tracing::warn!(linkedid = %cdr.linkedid, cdr_tenant = %a, cel_tenant = %b, "tenant mismatch between CDR and CEL signals, preferring CDR");
            Some(a)
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cdr::Disposition;
    use chrono::Utc;

    fn tenant_config() -> TenantConfig {
        let mut c = TenantConfig::default().with_defaults();
        c.known_trunks = vec!["sbc".to_string()];
        c
    }

    fn cdr(dstchannel: &str, dcontext: &str) -> Cdr {
        Cdr {
            calldate: Utc::now(),
            src: "4165551234".into(),
            dst: "100".into(),
            context: "from-trunk".into(),
            dcontext: dcontext.into(),
            channel: "SIP/sbc-ca2-telair-abc123".into(),
            dstchannel: dstchannel.into(),
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
    fn dcontext_pattern_wins_when_present() {
        let c = cdr("PJSIP/100-telair-def456", "from-did-direct-4164775498-telair");
        assert_eq!(extract_tenant(&c, &[], &tenant_config()).as_deref(), Some("telair"));
    }

    #[test]
    fn falls_back_to_dstchannel_rightmost_token() {
        let c = cdr("PJSIP/100-gconnect-def456", "from-trunk");
        assert_eq!(extract_tenant(&c, &[], &tenant_config()).as_deref(), Some("gconnect"));
    }

    #[test]
    fn known_trunk_names_are_rejected_as_candidates() {
        let c = cdr("PJSIP/sbc-def456", "from-trunk");
        // dstchannel has no valid token once "sbc" is excluded; falls through to context,
        // which itself is skip-listed, then channel "SIP/sbc-ca2-telair-abc123" -> "telair".
        assert_eq!(extract_tenant(&c, &[], &tenant_config()).as_deref(), Some("telair"));
    }

    #[test]
    fn purely_numeric_tokens_are_rejected() {
        assert!(is_rejected("12345", &[], false));
        assert!(!is_rejected("telair", &[], false));
    }

    #[test]
    fn skip_substrings_only_apply_when_requested() {
        assert!(is_rejected("pstnlink", &[], true));
        assert!(is_rejected("gw1", &[], true));
        assert!(!is_rejected("pstnlink", &[], false));
    }

    #[test]
    fn dstchannel_token_containing_skip_substring_is_rejected() {
        let c = cdr("PJSIP/gw1-def456", "from-trunk");
        // dstchannel's rightmost token "gw1" contains the skip substring "gw" and is rejected;
        // falls through to context (skip-listed) then channel "SIP/sbc-ca2-telair-abc123" -> "telair".
        assert_eq!(extract_tenant(&c, &[], &tenant_config()).as_deref(), Some("telair"));
    }

    fn cel_with_extra(extra: &str) -> Cel {
        Cel {
            eventtime: Utc::now(),
            eventtype: crate::model::CelEventType::ChanStart,
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
            extra: extra.into(),
        }
    }

    #[test]
    fn cdr_side_disagreement_with_cel_side_prefers_cdr() {
        let c = cdr("PJSIP/100-telair-def456", "from-did-direct-4164775498-telair");
        let cel = cel_with_extra(r#"{"tenant":"gconnect"}"#);
        assert_eq!(extract_tenant(&c, &[cel], &tenant_config()).as_deref(), Some("telair"));
    }

    #[test]
    fn cel_side_wins_when_cdr_side_absent() {
        let mut c = cdr("PJSIP/sbc-def456", "from-trunk");
        c.context = "sip".into();
        c.channel = "SIP/sbc-def456".into();
        let cel = cel_with_extra("tenant=cpapliving");
        assert_eq!(extract_tenant(&c, &[cel], &tenant_config()).as_deref(), Some("cpapliving"));
    }
}

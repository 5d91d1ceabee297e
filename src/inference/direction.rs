//! Deterministic inbound/outbound/internal classifier.

use serde::{Deserialize, Serialize};

use crate::config::TenantConfig;
use crate::model::Cdr;

use super::numbers::{is_extension, is_international};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(rename = "i")]
    Inbound,
    #[serde(rename = "o")]
    Outbound,
    #[serde(rename = "x")]
    Internal,
}

impl Direction {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Inbound => "i",
            Self::Outbound => "o",
            Self::Internal => "x",
        }
    }
}

pub struct DirectionResult {
    pub direction: Direction,
    pub likely_forwarded: bool,
}

fn matches_any(value: &str, candidates: &[String]) -> bool {
    let lowered = value.to_lowercase();
    candidates.iter().any(|c| {
        let c = c.to_lowercase();
        if let Some(prefix) = c.strip_suffix('*') {
            lowered.starts_with(prefix)
        } else {
            lowered == c || lowered.starts_with(&c)
        }
    })
}

fn is_local_channel(channel: &str) -> bool {
    channel.to_uppercase().starts_with("LOCAL/")
}

/// Applies the rules of §4.3 in order; the first that fires wins. Rule 1 (anonymous caller ID)
/// is checked unconditionally ahead of every other rule, including the dcontext-internal-routing
/// check, per SPEC_FULL.md's resolved rule ordering.
pub fn classify_direction(cdr: &Cdr, tenant: &TenantConfig) -> DirectionResult {
    let src_is_ext = is_extension(&cdr.src, tenant.extension_min_digits, tenant.extension_max_digits);
    let dst_is_ext = is_extension(&cdr.dst, tenant.extension_min_digits, tenant.extension_max_digits);
    let anonymous = super::numbers::is_anonymous_callerid(&cdr.src);

    // Rule 1: anonymous/private caller ID unconditionally forces inbound.
    if anonymous {
        return DirectionResult { direction: Direction::Inbound, likely_forwarded: !dst_is_ext };
    }

    // Rule 2: both endpoints are extensions.
    if src_is_ext && dst_is_ext {
        return DirectionResult { direction: Direction::Internal, likely_forwarded: false };
    }

    // Rule 3: destination context is internal-routing.
    if matches_any(&cdr.dcontext, &tenant.internal_contexts) {
        if dst_is_ext {
            return DirectionResult { direction: Direction::Internal, likely_forwarded: false };
        }
        return DirectionResult { direction: Direction::Outbound, likely_forwarded: false };
    }

    let internal_origin =
        is_local_channel(&cdr.channel) || matches_any(&cdr.context, &tenant.internal_contexts) || src_is_ext;

    if internal_origin {
        // Rule 4: channel/context indicates internal origin.
        if dst_is_ext {
            return DirectionResult { direction: Direction::Internal, likely_forwarded: false };
        }
        if matches_any(&cdr.dcontext, &tenant.outbound_route_contexts)
            || is_international(&cdr.dst, &tenant.international_prefixes)
        {
            return DirectionResult { direction: Direction::Outbound, likely_forwarded: false };
        }
        return DirectionResult { direction: Direction::Outbound, likely_forwarded: false };
    }

    // Rule 5: external origin.
    if dst_is_ext {
        return DirectionResult { direction: Direction::Inbound, likely_forwarded: false };
    }
    if matches_any(&cdr.dcontext, &tenant.outbound_route_contexts) {
        return DirectionResult { direction: Direction::Outbound, likely_forwarded: true };
    }
    DirectionResult { direction: Direction::Inbound, likely_forwarded: true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cdr::Disposition;
    use chrono::Utc;

    fn tenant() -> TenantConfig {
        TenantConfig::default().with_defaults()
    }

    fn cdr(src: &str, dst: &str, channel: &str, context: &str, dcontext: &str) -> Cdr {
        Cdr {
            calldate: Utc::now(),
            src: src.into(),
            dst: dst.into(),
            context: context.into(),
            dcontext: dcontext.into(),
            channel: channel.into(),
            dstchannel: String::new(),
            disposition: Disposition::Answered,
            duration: 10,
            billsec: 10,
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            accountcode: String::new(),
            amaflags: 3,
            lastapp: "Dial".into(),
            lastdata: String::new(),
        }
    }

    #[test]
    fn inbound_to_extension_via_did_direct_dcontext() {
        let c = cdr(
            "4165551234",
            "100",
            "SIP/sbc-ca2-telair-abc123",
            "from-trunk",
            "from-did-direct-4164775498-telair",
        );
        let result = classify_direction(&c, &tenant());
        assert_eq!(result.direction, Direction::Inbound);
    }

    #[test]
    fn outbound_from_extension() {
        let c = cdr("200", "14165559999", "PJSIP/200-gconnect-aaa111", "from-internal", "outrt-1-trunk");
        let result = classify_direction(&c, &tenant());
        assert_eq!(result.direction, Direction::Outbound);
    }

    #[test]
    fn extension_to_extension_is_internal() {
        let c = cdr("200", "201", "PJSIP/200-telair-x", "from-internal", "from-internal");
        let result = classify_direction(&c, &tenant());
        assert_eq!(result.direction, Direction::Internal);
    }

    #[test]
    fn anonymous_inbound_is_forced_inbound() {
        let c = cdr("anonymous", "100", "SIP/trunk-1", "from-trunk", "from-trunk");
        let result = classify_direction(&c, &tenant());
        assert_eq!(result.direction, Direction::Inbound);
        assert!(!result.likely_forwarded);
    }

    #[test]
    fn anonymous_caller_overrides_internal_routing_dcontext() {
        // dcontext matches the internal-contexts set and dst is an extension, which would
        // otherwise fire rule 3 (internal-routing -> internal); the anonymous caller ID must
        // still force inbound ahead of that rule.
        let c = cdr("anonymous", "100", "SIP/trunk-1", "from-trunk", "from-internal");
        let result = classify_direction(&c, &tenant());
        assert_eq!(result.direction, Direction::Inbound);
        assert!(!result.likely_forwarded);
    }

    #[test]
    fn anonymous_caller_with_non_extension_destination_is_flagged_forwarded() {
        let c = cdr("anonymous", "14165559999", "SIP/trunk-1", "from-trunk", "from-trunk");
        let result = classify_direction(&c, &tenant());
        assert_eq!(result.direction, Direction::Inbound);
        assert!(result.likely_forwarded);
    }
}

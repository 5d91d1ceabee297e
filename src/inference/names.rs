//! Display-name extraction: matching CEL caller-ID names to inferred numbers/extensions.

use crate::model::Cel;

use super::patterns::STRUCTURED_NAME_PREFIX;

#[derive(Debug, Clone, Default)]
pub struct ExtractedNames {
    pub src_name: Option<String>,
    pub dst_name: Option<String>,
}

fn strip_structured_prefix(name: &str) -> String {
    if let Some(caps) = STRUCTURED_NAME_PREFIX.captures(name) {
        if let Some(m) = caps.get(1) {
            let trailing = m.as_str().trim();
            if !trailing.chars().all(|c| c.is_ascii_digit()) && !trailing.is_empty() {
                return trailing.to_string();
            }
        }
    }
    name.trim().to_string()
}

/// For each CEL event whose `cid_num` matches the normalized source number, its `cid_name`
/// becomes `src_name` (after stripping any structured site-specific prefix). The destination
/// extension's display name is read off a SIP/PJSIP channel-name prefix match in CEL.
pub fn extract_names(
    cels: &[Cel],
    src_number: Option<&str>,
    dst_extension: Option<&str>,
) -> ExtractedNames {
    let mut result = ExtractedNames::default();

    if let Some(src_number) = src_number {
        for cel in cels {
            if !cel.cid_num.is_empty() && cel.cid_num == src_number && !cel.cid_name.is_empty() {
                result.src_name = Some(strip_structured_prefix(&cel.cid_name));
                break;
            }
        }
    }

    if let Some(dst_ext) = dst_extension {
        let prefix_sip = format!("SIP/{}-", dst_ext);
        let prefix_pjsip = format!("PJSIP/{}-", dst_ext);
        for cel in cels {
            if cel.channame.starts_with(&prefix_sip) || cel.channame.starts_with(&prefix_pjsip) {
                if !cel.cid_name.is_empty() {
                    result.dst_name = Some(strip_structured_prefix(&cel.cid_name));
                    break;
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CelEventType;
    use chrono::Utc;

    fn cel(cid_num: &str, cid_name: &str, channame: &str) -> Cel {
        Cel {
            eventtime: Utc::now(),
            eventtype: CelEventType::Answer,
            cid_name: cid_name.into(),
            cid_num: cid_num.into(),
            cid_dnid: String::new(),
            exten: String::new(),
            context: String::new(),
            channame: channame.into(),
            appname: String::new(),
            appdata: String::new(),
            uniqueid: "1.1".into(),
            linkedid: "1.1".into(),
            peer: String::new(),
            extra: String::new(),
        }
    }

    #[test]
    fn structured_prefix_is_stripped_to_trailing_name() {
        assert_eq!(strip_structured_prefix("416-55-Acme-Corp-Jane Doe"), "Jane Doe");
    }

    #[test]
    fn purely_numeric_trailing_fragments_are_discarded() {
        // no capture match (not 3-2-alpha pattern) falls through to raw trimmed name
        assert_eq!(strip_structured_prefix("4165551234"), "4165551234");
    }

    #[test]
    fn src_name_matches_by_normalized_number() {
        let cels = vec![cel("14165551234", "Jane Doe", "SIP/trunk-1")];
        let names = extract_names(&cels, Some("14165551234"), None);
        assert_eq!(names.src_name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn dst_name_matches_by_channel_prefix() {
        let cels = vec![cel("100", "Reception", "PJSIP/100-00000a1b")];
        let names = extract_names(&cels, None, Some("100"));
        assert_eq!(names.dst_name.as_deref(), Some("Reception"));
    }
}

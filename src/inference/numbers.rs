//! Extension tests and number normalization.

use once_cell::sync::Lazy;
use regex::Regex;

static EXTENSION_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+\d{10,15}$").unwrap());

/// A string is an extension iff it begins with `*` or is `min..=max` decimal digits.
pub fn is_extension(value: &str, min_digits: usize, max_digits: usize) -> bool {
    if value.is_empty() {
        return false;
    }
    if value.starts_with('*') {
        return true;
    }
    EXTENSION_DIGITS.is_match(value) && value.len() >= min_digits && value.len() <= max_digits
}

/// Strips everything but digits, `+`, and `*`/`#`; 10-digit results get a North American `1`
/// prefix (configurable); already-E.164 numbers pass through unchanged. Idempotent.
pub fn normalize_number(raw: &str, assume_north_american: bool) -> String {
    if raw.is_empty() {
        return String::new();
    }
    if E164.is_match(raw) {
        return raw.to_string();
    }

    let stripped: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+' || *c == '*' || *c == '#')
        .collect();

    if E164.is_match(&stripped) {
        return stripped;
    }

    if assume_north_american && stripped.len() == 10 && stripped.chars().all(|c| c.is_ascii_digit()) {
        return format!("1{}", stripped);
    }

    stripped
}

pub fn is_international(value: &str, international_prefixes: &[String]) -> bool {
    if E164.is_match(value) {
        return true;
    }
    international_prefixes.iter().any(|p| value.starts_with(p.as_str()))
}

pub fn is_anonymous_callerid(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    crate::inference::patterns::ANONYMOUS_CALLERID_MARKERS
        .iter()
        .any(|marker| lowered == *marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_digit_numbers_get_north_american_prefix() {
        assert_eq!(normalize_number("(416) 555-1234", true), "14165551234");
    }

    #[test]
    fn e164_passes_through_unchanged() {
        assert_eq!(normalize_number("+442071234567", true), "+442071234567");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_number("4165551234", true);
        let twice = normalize_number(&once, true);
        assert_eq!(once, twice);
    }

    #[test]
    fn extension_bounds_are_respected() {
        assert!(is_extension("100", 2, 7));
        assert!(is_extension("*97", 2, 7));
        assert!(!is_extension("1", 2, 7));
        assert!(!is_extension("12345678", 2, 7));
        assert!(!is_extension("abc", 2, 7));
    }

    #[test]
    fn anonymous_markers_are_case_insensitive() {
        assert!(is_anonymous_callerid("Anonymous"));
        assert!(is_anonymous_callerid("UNKNOWN"));
        assert!(!is_anonymous_callerid("4165551234"));
    }
}

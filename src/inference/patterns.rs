//! Compiled regex banks used by direction and tenant inference.

use once_cell::sync::Lazy;
use regex::Regex;

/// `dcontext` patterns that embed a tenant label, tried in order; the first capture group of
/// whichever regex matches is the tenant candidate.
pub static DCONTEXT_TENANT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // <ext>-<did>-<ext>-<desc>-<tenant>
        Regex::new(r"(?i)^ext-\d+-ext-[a-z0-9]+-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
        // from-outside-<did>-<desc>-<tenant>
        Regex::new(r"(?i)^from-outside-\d+-[a-z0-9]+-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
        // ext-<did>-<tenant>
        Regex::new(r"(?i)^ext-\d+-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
        // from-did-direct-<did>-<tenant>
        Regex::new(r"(?i)^from-did-direct-\d+-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
        // from-(internal|inside|inside-redir|inside-restricted-redir)-<tenant>
        Regex::new(r"(?i)^from-(?:internal|inside|inside-redir|inside-restricted-redir)-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
        // local-extensions-<tenant>
        Regex::new(r"(?i)^local-extensions-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
        // outgoing-<tenant>
        Regex::new(r"(?i)^outgoing-([a-z0-9][a-z0-9_-]{2,})$").unwrap(),
    ]
});

/// Fallback match against a raw `extra` string when it isn't JSON: `tenant=<value>`.
pub static EXTRA_TENANT_KV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)tenant=([a-z0-9][a-z0-9_-]{2,})").unwrap());

/// Trailing 6+ hex-char unique suffix Asterisk appends to a channel name, e.g. `PJSIP/100-00000a1b`.
pub static CHANNEL_UNIQUE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-[0-9a-fA-F]{6,}$").unwrap());

/// A token is purely hexadecimal (and not purely decimal, which is checked separately).
pub static PURELY_HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]+$").unwrap());

pub static PURELY_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

/// Structured prefix on long caller-ID names: `123-45-Acme-Corp-Jane Doe` -> `Jane Doe`.
pub static STRUCTURED_NAME_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{3}-\d{2}-[A-Za-z]+-.*?-(.+)$").unwrap());

/// Tokens rejected as tenant candidates regardless of source: protocol names, directional
/// markers, and carrier/location shorthand that is never itself a tenant label.
pub const TENANT_SKIP_SET: &[&str] = &[
    "sip", "pjsip", "iax", "dahdi", "local", "from", "to", "did", "direct", "trunk", "peer",
    "sbc", "ca1", "ca2", "us1", "us2", "closed", "open", "internal", "external",
];

/// Substring (not exact-match) rejection terms applied to `dstchannel`/`channel` (and their CEL
/// counterparts `channame`/`peer`) candidates: a token containing any of these anywhere is
/// carrier/trunk shorthand, never a tenant label.
pub const TENANT_SKIP_SUBSTRINGS: &[&str] = &["sbc", "trunk", "peer", "server", "gw", "gateway", "pstn"];

pub const ANONYMOUS_CALLERID_MARKERS: &[&str] =
    &["anonymous", "private", "restricted", "unavailable", "unknown"];

/// Asterisk's reserved pseudo-destinations: never real extensions, always signal that the
/// dialed DID must be recovered from CEL instead.
pub const PSEUDO_DESTINATIONS: &[&str] = &["s", "h", "i", "t"];

//! Local, DB-free rate limiting derived entirely from the shape of the API key. A key matching
//! the tiered pattern `sk_t<tier>_c<customer_id>_<token>` (20+ char trailing token) enforces a
//! rolling 60-second request count; a looser legacy `sk_<token>` key, or anything else, is an
//! opaque bearer token with no local cap.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

static TIERED_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sk_t([0-4])_c(\d+)_[A-Za-z0-9]{20,}$").unwrap());
static LEGACY_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sk_[A-Za-z0-9]{20,}$").unwrap());

#[derive(Debug, Clone, Copy)]
struct TierLimits {
    requests_per_minute: u32,
    queue_delay_secs: u64,
}

const TIER_TABLE: [TierLimits; 5] = [
    TierLimits { requests_per_minute: 10, queue_delay_secs: 60 },
    TierLimits { requests_per_minute: 60, queue_delay_secs: 20 },
    TierLimits { requests_per_minute: 300, queue_delay_secs: 10 },
    TierLimits { requests_per_minute: 1200, queue_delay_secs: 5 },
    TierLimits { requests_per_minute: 3600, queue_delay_secs: 2 },
];

/// Parses an API key's embedded tier, if any. Returns `None` for legacy or opaque keys, which
/// carry no local rate limit.
fn parse_tier(key: &str) -> Option<usize> {
    let caps = TIERED_KEY.captures(key)?;
    let tier: usize = caps.get(1)?.as_str().parse().ok()?;
    if tier <= 4 {
        Some(tier)
    } else {
        None
    }
}

pub fn is_recognized_key(key: &str) -> bool {
    TIERED_KEY.is_match(key) || LEGACY_KEY.is_match(key)
}

pub struct RateLimiter {
    limits: Option<TierLimits>,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn from_api_key(key: &str) -> Self {
        let limits = parse_tier(key).map(|tier| TIER_TABLE[tier]);
        Self { limits, window: Mutex::new(VecDeque::new()) }
    }

    /// Blocks until a request slot is available under the rolling 60s window, then reserves it.
    /// A no-op for keys without an embedded tier.
    pub async fn acquire(&self) {
        let Some(limits) = self.limits else { return };
        loop {
            let wait = {
                let mut window = self.window.lock().expect("rate limiter window mutex poisoned");
                let now = Instant::now();
                while window.front().map(|t| now.duration_since(*t) >= Duration::from_secs(60)).unwrap_or(false) {
                    window.pop_front();
                }
                if window.len() < limits.requests_per_minute as usize {
                    window.push_back(now);
                    None
                } else {
                    Some(Duration::from_secs(limits.queue_delay_secs))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiered_key_parses_embedded_tier() {
        assert_eq!(parse_tier("sk_t2_c1234_abcdefghijklmnopqrstuvwx"), Some(2));
    }

    #[test]
    fn short_token_without_customer_segment_is_not_tiered() {
        assert_eq!(parse_tier("sk_t1_test"), None);
        assert_eq!(parse_tier("sk_t1_c42_tooshort"), None);
    }

    #[test]
    fn legacy_key_has_no_tier() {
        assert_eq!(parse_tier("sk_abcdefghijklmnopqrstuvwxyz012345"), None);
    }

    #[test]
    fn unrecognized_key_is_still_accepted_as_opaque_token() {
        assert!(!is_recognized_key("whatever-this-is"));
        assert_eq!(parse_tier("whatever-this-is"), None);
    }

    #[tokio::test]
    async fn untiered_key_never_blocks() {
        let limiter = RateLimiter::from_api_key("opaque-token");
        for _ in 0..50 {
            limiter.acquire().await;
        }
    }
}

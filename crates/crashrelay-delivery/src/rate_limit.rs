//! Rate limits reported by the ingestion endpoint
//!
//! Two headers feed a per-category "disabled until" map:
//!
//! - `X-Sentry-Rate-Limits`: `retry_after:categories:scope[:reason[:namespaces]]`
//!   entries separated by `,`; categories are `;`-separated and an empty list
//!   limits every category.
//! - `Retry-After` on a 429 without the above: every category, for the given
//!   seconds or until the given HTTP date.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crashrelay_core::ports::TransportResponse;
//! use crashrelay_delivery::rate_limit::RateLimits;
//!
//! let limits = RateLimits::new();
//! limits.update(&TransportResponse {
//!     status: 429,
//!     rate_limits: Some("60:error;transaction:organization".into()),
//!     retry_after: None,
//! });
//! assert!(limits.is_limited("error"));
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crashrelay_core::ports::TransportResponse;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Used when a limit carries no usable delay
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Key standing for every category
const ALL: &str = "all";

// ============================================================================
// Header parsing
// ============================================================================

/// Parses a Retry-After header value into a Duration.
///
/// The header can be either:
/// - An integer number of seconds (e.g., "30")
/// - An HTTP-date (e.g., "Fri, 31 Dec 2025 23:59:59 GMT") - parsed as seconds from now
///
/// Falls back to the default duration if parsing fails.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let diff = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return diff.to_std().unwrap_or(Duration::ZERO);
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}

/// Parses `X-Sentry-Rate-Limits` into `(categories, delay)` pairs.
///
/// An empty category list means every category.
pub fn parse_rate_limits(header: &str) -> Vec<(Vec<String>, Duration)> {
    header
        .split(',')
        .map(str::trim)
        .filter(|limit| !limit.is_empty())
        .map(|limit| {
            let mut parts = limit.splitn(5, ':');
            let delay = parts
                .next()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            let categories = parts
                .next()
                .unwrap_or_default()
                .split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
            (categories, delay)
        })
        .collect()
}

// ============================================================================
// RateLimits
// ============================================================================

/// Per-category disabled-until instants
#[derive(Debug, Default)]
pub struct RateLimits {
    until: Mutex<HashMap<String, Instant>>,
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the limits a response announces
    pub fn update(&self, response: &TransportResponse) {
        let now = Instant::now();
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(header) = &response.rate_limits {
            for (categories, delay) in parse_rate_limits(header) {
                if categories.is_empty() {
                    until.insert(ALL.to_string(), now + delay);
                }
                for category in categories {
                    until.insert(category, now + delay);
                }
            }
        } else if response.status == 429 {
            let delay = response
                .retry_after
                .as_deref()
                .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER))
                .unwrap_or(DEFAULT_RETRY_AFTER);
            until.insert(ALL.to_string(), now + delay);
        } else {
            return;
        }
        debug!(limits = ?until.keys().collect::<Vec<_>>(), "Rate limits updated");
    }

    /// Time left until `category` may be sent again
    pub fn remaining(&self, category: &str) -> Option<Duration> {
        let now = Instant::now();
        let until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        [category, ALL]
            .iter()
            .filter_map(|key| until.get(*key))
            .filter(|deadline| **deadline > now)
            .map(|deadline| *deadline - now)
            .max()
    }

    pub fn is_limited(&self, category: &str) -> bool {
        self.remaining(category).is_some()
    }

    /// Returns the longest remaining delay if every category is limited
    pub fn all_limited(&self, categories: &[String]) -> Option<Duration> {
        if categories.is_empty() {
            return None;
        }
        let mut longest = Duration::ZERO;
        for category in categories {
            longest = longest.max(self.remaining(category)?);
        }
        Some(longest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(status: u16, rate_limits: Option<&str>, retry_after: Option<&str>) -> TransportResponse {
        TransportResponse {
            status,
            rate_limits: rate_limits.map(String::from),
            retry_after: retry_after.map(String::from),
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30", DEFAULT_RETRY_AFTER), Duration::from_secs(30));
        assert_eq!(parse_retry_after("  45  ", DEFAULT_RETRY_AFTER), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_retry_after_invalid_falls_back() {
        let default = Duration::from_secs(7);
        assert_eq!(parse_retry_after("not-a-number", default), default);
        assert_eq!(parse_retry_after("", default), default);
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past_is_zero() {
        let d = parse_retry_after("Fri, 31 Dec 1999 23:59:59 GMT", DEFAULT_RETRY_AFTER);
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn test_parse_rate_limits_header() {
        let parsed = parse_rate_limits("60:error;transaction:organization, 2700::organization:quota, bad");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].0, vec!["error", "transaction"]);
        assert_eq!(parsed[0].1, Duration::from_secs(60));
        assert!(parsed[1].0.is_empty());
        assert_eq!(parsed[1].1, Duration::from_secs(2700));
        assert_eq!(parsed[2].1, DEFAULT_RETRY_AFTER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_limit_expires() {
        let limits = RateLimits::new();
        limits.update(&limited(429, Some("10:error:organization"), None));

        assert!(limits.is_limited("error"));
        assert!(!limits.is_limited("session"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!limits.is_limited("error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_limits_everything() {
        let limits = RateLimits::new();
        limits.update(&limited(429, None, Some("5")));
        assert!(limits.is_limited("session"));
        assert!(limits.is_limited("attachment"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_without_headers_changes_nothing() {
        let limits = RateLimits::new();
        limits.update(&TransportResponse::ok());
        assert!(!limits.is_limited("error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_limited_requires_every_category() {
        let limits = RateLimits::new();
        limits.update(&limited(200, Some("30:error"), None));

        let error_only = vec!["error".to_string()];
        let mixed = vec!["error".to_string(), "attachment".to_string()];
        assert_eq!(limits.all_limited(&error_only), Some(Duration::from_secs(30)));
        assert_eq!(limits.all_limited(&mixed), None);
        assert_eq!(limits.all_limited(&[]), None);
    }
}

//! Per-domain rate limiting for network requests.
//!
//! Queued callers each advance the domain's next-allowed timestamp inside
//! one short lock section, so aggregate throughput per domain converges
//! on the configured rate even under concurrency.

use crate::extractors::urlnorm::extract_domain;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("rate_per_domain must be > 0, got {0}")]
pub struct InvalidRate(pub f64);

/// Enforces a minimum interval of `1 / rate` seconds between requests to
/// the same domain.
pub struct DomainRateLimiter {
    min_interval: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl DomainRateLimiter {
    pub fn new(rate_per_domain: f64) -> Result<Self, InvalidRate> {
        if rate_per_domain <= 0.0 || !rate_per_domain.is_finite() {
            return Err(InvalidRate(rate_per_domain));
        }
        Ok(Self {
            min_interval: Duration::from_secs_f64(1.0 / rate_per_domain),
            next_allowed: Mutex::new(HashMap::new()),
        })
    }

    /// Sleep until this domain's next slot; unparseable URLs pass freely.
    pub async fn wait(&self, url: &str) {
        let domain = extract_domain(url);
        if domain.is_empty() {
            return;
        }

        let delay = {
            let mut slots = match self.next_allowed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let slot = slots
                .get(&domain)
                .map(|last| (*last + self.min_interval).max(now))
                .unwrap_or(now);
            slots.insert(domain, slot);
            slot.saturating_duration_since(now)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_rates() {
        assert!(DomainRateLimiter::new(0.0).is_err());
        assert!(DomainRateLimiter::new(-1.0).is_err());
        assert!(DomainRateLimiter::new(f64::NAN).is_err());
        assert!(DomainRateLimiter::new(2.0).is_ok());
    }

    #[tokio::test]
    async fn spaces_requests_to_the_same_domain() {
        let limiter = DomainRateLimiter::new(50.0).unwrap(); // 20ms interval
        let start = Instant::now();
        limiter.wait("https://example.com/a").await;
        limiter.wait("https://example.com/b").await;
        limiter.wait("https://example.com/c").await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn different_domains_do_not_block_each_other() {
        let limiter = DomainRateLimiter::new(1.0).unwrap();
        let start = Instant::now();
        limiter.wait("https://a.example.com/").await;
        limiter.wait("https://b.example.com/").await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn invalid_urls_pass_through() {
        let limiter = DomainRateLimiter::new(0.001).unwrap();
        let start = Instant::now();
        limiter.wait("not a url").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}

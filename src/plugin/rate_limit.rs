//! Per-client rate limiting plugin
//!
//! Uses the governor crate for efficient, lock-free rate limiting.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use tracing::{debug, warn};

use super::{HttpProxyPlugin, RequestDecision};
use crate::error::{ProxyError, Result};
use crate::http::{HttpParser, Rejection};

/// Tracked clients above which idle entries are evicted on the next check
const CLEANUP_THRESHOLD: usize = 10_000;

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug)]
struct ClientLimiter {
    limiter: Arc<DirectLimiter>,
    last_seen_ms: AtomicU64,
}

impl ClientLimiter {
    fn new(limiter: Arc<DirectLimiter>, now_ms: u64) -> Self {
        Self {
            limiter,
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Token-bucket limiter keyed by client IP, shared across connections
#[derive(Clone)]
pub struct RateLimiter {
    /// Rate limiters per client IP
    limiters: Arc<DashMap<String, ClientLimiter>>,
    /// Requests per second limit
    requests_per_second: NonZeroU32,
    /// Burst size
    burst_size: NonZeroU32,
    /// How long to keep per-client state without activity
    max_idle: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            limiters: Arc::new(DashMap::new()),
            requests_per_second: NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN),
            burst_size: NonZeroU32::new(burst_size).unwrap_or(NonZeroU32::MIN),
            max_idle: Duration::from_secs(10 * 60),
        }
    }

    #[cfg(test)]
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Check if a request from the given client IP is allowed
    pub fn check(&self, client_ip: &str) -> Result<()> {
        if self.limiters.len() > CLEANUP_THRESHOLD {
            self.cleanup();
        }

        let limiter = self.get_or_create_limiter(client_ip);

        match limiter.check() {
            Ok(_) => {
                debug!("Rate limit check passed for {}", client_ip);
                Ok(())
            }
            Err(_) => {
                warn!("Rate limit exceeded for {}", client_ip);
                Err(ProxyError::RateLimitExceeded {
                    client_ip: client_ip.to_string(),
                })
            }
        }
    }

    /// Get or create a rate limiter for the given client IP
    fn get_or_create_limiter(&self, client_ip: &str) -> Arc<DirectLimiter> {
        let now_ms = now_ms();
        let entry = self.limiters.entry(client_ip.to_string()).or_insert_with(|| {
            let quota = Quota::per_second(self.requests_per_second).allow_burst(self.burst_size);
            ClientLimiter::new(Arc::new(GovRateLimiter::direct(quota)), now_ms)
        });

        entry.last_seen_ms.store(now_ms, Ordering::Relaxed);

        entry.limiter.clone()
    }

    /// Drop state for clients idle longer than `max_idle`
    pub fn cleanup(&self) {
        let now_ms = now_ms();
        let max_idle_ms = self.max_idle.as_millis() as u64;

        self.limiters.retain(|_, entry| {
            let last_seen = entry.last_seen_ms.load(Ordering::Relaxed);
            now_ms.saturating_sub(last_seen) <= max_idle_ms
        });
    }

    /// Get the number of tracked clients
    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.limiters.len()
    }
}

/// Rejects requests with 429 once the client's bucket is empty
pub struct RateLimitPlugin {
    limiter: RateLimiter,
    client_ip: IpAddr,
}

impl RateLimitPlugin {
    pub fn new(limiter: RateLimiter, client_ip: IpAddr) -> Self {
        Self { limiter, client_ip }
    }
}

#[async_trait]
impl HttpProxyPlugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before_upstream_connection(&mut self, request: HttpParser) -> RequestDecision {
        match self.limiter.check(&self.client_ip.to_string()) {
            Ok(()) => RequestDecision::Forward(request),
            Err(err) => RequestDecision::Reject(Rejection::from_error(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ParserLimits;

    #[test]
    fn test_rate_limiter_allows_within_limit() {
        let limiter = RateLimiter::new(10, 10);

        // Should allow up to burst size
        for i in 0..10 {
            assert!(
                limiter.check("192.168.1.1").is_ok(),
                "Failed on request {}",
                i
            );
        }
    }

    #[test]
    fn test_rate_limiter_blocks_over_limit() {
        let limiter = RateLimiter::new(1, 2);

        // First two should pass (burst)
        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(limiter.check("192.168.1.1").is_ok());

        // Third should fail
        assert!(matches!(
            limiter.check("192.168.1.1"),
            Err(ProxyError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_rate_limiter_per_ip() {
        let limiter = RateLimiter::new(1, 1);

        // Different IPs should have separate limits
        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(limiter.check("192.168.1.2").is_ok());
        assert!(limiter.check("192.168.1.3").is_ok());

        // Same IP should be limited
        assert!(matches!(
            limiter.check("192.168.1.1"),
            Err(ProxyError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let limiter = RateLimiter::new(1, 1);
        let clone = limiter.clone();

        assert!(limiter.check("10.0.0.1").is_ok());
        assert!(clone.check("10.0.0.1").is_err());
        assert_eq!(clone.client_count(), 1);
    }

    #[test]
    fn test_cleanup_evicts_idle_clients() {
        let limiter = RateLimiter::new(10, 10).with_max_idle(Duration::ZERO);
        limiter.check("192.168.1.1").ok();
        limiter.check("192.168.1.2").ok();
        assert_eq!(limiter.client_count(), 2);

        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert_eq!(limiter.client_count(), 0);
    }

    #[tokio::test]
    async fn test_plugin_rejects_with_429() {
        let limiter = RateLimiter::new(1, 1);
        let mut plugin = RateLimitPlugin::new(limiter, "127.0.0.1".parse().unwrap());

        let request = || {
            let mut parser = HttpParser::request(ParserLimits::default());
            parser
                .feed(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
                .unwrap();
            parser
        };

        assert!(matches!(
            plugin.before_upstream_connection(request()).await,
            RequestDecision::Forward(_)
        ));
        match plugin.before_upstream_connection(request()).await {
            RequestDecision::Reject(rejection) => assert_eq!(rejection.status().as_u16(), 429),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}

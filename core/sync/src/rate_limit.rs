//! Client-side request throttle keyed by endpoint and method.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use lifetrack_common::HttpMethod;

/// Token bucket parameters shared by every key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst of requests allowed at once.
    pub burst: u32,
    /// Tokens regained per second.
    pub refill_per_second: f64,
    /// Buckets untouched for this long are dropped.
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            refill_per_second: 5.0,
            idle_eviction: Duration::from_secs(300),
        }
    }
}

/// A simple token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type BucketKey = (String, HttpMethod);

/// Per-(endpoint, method) rate limiter.
///
/// Buckets are created lazily on first use of a key.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<BucketKey, TokenBucket>>,
}

impl RateLimiter {
    /// Create a limiter with the given policy.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request to `endpoint` with `method` may be sent now.
    pub async fn should_allow(&self, endpoint: &str, method: HttpMethod) -> bool {
        let capacity = f64::from(self.config.burst);
        let mut buckets = self.buckets.lock().await;

        let idle_eviction = self.config.idle_eviction;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_update.elapsed() < idle_eviction);
        if buckets.len() < before {
            debug!("Evicted {} idle rate-limit buckets", before - buckets.len());
        }

        let bucket = buckets
            .entry((endpoint.to_string(), method))
            .or_insert_with(|| TokenBucket::new(capacity));

        let allowed = bucket.try_acquire(capacity, self.config.refill_per_second);
        if !allowed {
            warn!("Rate limit exceeded for {} {}", method, endpoint);
        }
        allowed
    }

    /// Number of live buckets.
    pub async fn tracked_keys(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            burst: 3,
            refill_per_second: 0.001,
            idle_eviction: Duration::from_secs(300),
        })
    }

    #[tokio::test]
    async fn test_allows_within_burst() {
        let limiter = tight_limiter();
        for _ in 0..3 {
            assert!(limiter.should_allow("/api/v1/food", HttpMethod::Post).await);
        }
        assert!(!limiter.should_allow("/api/v1/food", HttpMethod::Post).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = tight_limiter();
        for _ in 0..3 {
            limiter.should_allow("/api/v1/food", HttpMethod::Post).await;
        }

        assert!(limiter.should_allow("/api/v1/food", HttpMethod::Get).await);
        assert!(limiter.should_allow("/api/v1/finance", HttpMethod::Post).await);
        assert_eq!(limiter.tracked_keys().await, 3);
    }

    #[tokio::test]
    async fn test_refill_restores_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 1,
            refill_per_second: 100.0,
            idle_eviction: Duration::from_secs(300),
        });

        assert!(limiter.should_allow("/x", HttpMethod::Get).await);
        assert!(!limiter.should_allow("/x", HttpMethod::Get).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.should_allow("/x", HttpMethod::Get).await);
    }

    #[tokio::test]
    async fn test_sustained_rate_below_threshold_always_allowed() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 2,
            refill_per_second: 200.0,
            idle_eviction: Duration::from_secs(300),
        });

        for _ in 0..10 {
            assert!(limiter.should_allow("/y", HttpMethod::Put).await);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_idle_buckets_are_evicted() {
        let limiter = RateLimiter::new(RateLimitConfig {
            idle_eviction: Duration::from_millis(10),
            ..RateLimitConfig::default()
        });

        limiter.should_allow("/old", HttpMethod::Get).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.should_allow("/new", HttpMethod::Get).await;

        assert_eq!(limiter.tracked_keys().await, 1);
    }
}

//! Token-bucket rate limiter.
//!
//! One bucket per identity (typically a client IP), held in a process-wide
//! `Mutex<HashMap>` - no sharding, no lock-free structure, since a single
//! `lock()` per request is cheap next to the I/O this crate is built around.
//! A background task evicts buckets nobody has touched in a while so the
//! table stays bounded even under a churn of distinct identities.

use crate::limits::RateLimiterLimits;
use std::{
    cmp::min,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::trace;

/// Per-identity token-bucket configuration.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Tokens granted over each `duration` window.
    pub requests: u32,
    /// Length of the refill window.
    pub duration: Duration,
    /// Maximum tokens a bucket can hold at once.
    pub burst: u32,
    /// How long an idle bucket survives before the eviction sweep reclaims it.
    pub expires_in: Duration,
}

impl BucketConfig {
    #[inline]
    fn refill_rate(&self) -> f64 {
        self.requests as f64 / self.duration.as_secs_f64()
    }

    /// Effective bucket capacity. `burst == 0` still allows a single token
    /// to accumulate over time instead of permanently capping the bucket at
    /// zero; it configures "no extra burst above the steady rate", not "this
    /// identity can never be let through."
    #[inline]
    fn capacity(&self) -> f64 {
        self.burst.max(1) as f64
    }
}

struct Visitor {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct Inner {
    visitors: Mutex<HashMap<String, Visitor>>,
    config: BucketConfig,
    limits: RateLimiterLimits,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// A shared, cloneable token-bucket limiter keyed by caller-chosen identity.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Builds a limiter and spawns its background eviction task, which wakes
    /// every `min(config.duration, config.expires_in / 2)`.
    pub fn new(config: BucketConfig, limits: RateLimiterLimits) -> Self {
        let inner = Arc::new(Inner {
            visitors: Mutex::new(HashMap::new()),
            config,
            limits,
            sweeper: Mutex::new(None),
        });

        let sweep_inner = Arc::clone(&inner);
        let period = min(config.duration, config.expires_in / 2);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period.max(Duration::from_millis(1)));
            loop {
                tick.tick().await;
                sweep_inner.sweep();
            }
        });
        *inner.sweeper.lock().unwrap() = Some(handle);

        RateLimiter { inner }
    }

    /// Consumes a token for `identity` if one is available. Creates a fresh,
    /// full bucket on first observation. Returns `false` (rejected) without
    /// consuming a token if the bucket is empty or the visitor table is full.
    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut visitors = self.inner.visitors.lock().unwrap();

        if let Some(visitor) = visitors.get_mut(identity) {
            self.inner.config.refill(visitor, now);
            visitor.last_seen = now;

            if visitor.tokens >= 1.0 {
                visitor.tokens -= 1.0;
                return true;
            }
            trace!(target: "ratelimit", "rejected {identity}: bucket empty");
            return false;
        }

        if visitors.len() >= self.inner.limits.max_visitors {
            trace!(target: "ratelimit", "rejected {identity}: visitor table full");
            return false;
        }

        visitors.insert(
            identity.to_string(),
            Visitor {
                tokens: self.inner.config.capacity() - 1.0,
                last_refill: now,
                last_seen: now,
            },
        );
        true
    }

    /// Stops the background eviction task. Safe to call more than once.
    pub fn close(&self) {
        if let Some(handle) = self.inner.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl BucketConfig {
    fn refill(&self, visitor: &mut Visitor, now: Instant) {
        let elapsed = now.saturating_duration_since(visitor.last_refill).as_secs_f64();
        visitor.tokens = (visitor.tokens + elapsed * self.refill_rate()).min(self.capacity());
        visitor.last_refill = now;
    }
}

impl Inner {
    fn sweep(&self) {
        let now = Instant::now();
        let expires_in = self.config.expires_in;
        self.visitors
            .lock()
            .unwrap()
            .retain(|_, visitor| now.saturating_duration_since(visitor.last_seen) < expires_in);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::RateLimiterLimits;

    fn limiter(burst: u32) -> RateLimiter {
        RateLimiter::new(
            BucketConfig {
                requests: burst,
                duration: Duration::from_secs(60),
                burst,
                expires_in: Duration::from_secs(120),
            },
            RateLimiterLimits::default(),
        )
    }

    #[tokio::test]
    async fn allows_up_to_burst_then_rejects() {
        let limiter = limiter(3);
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        limiter.close();
    }

    #[tokio::test]
    async fn distinct_identities_have_independent_buckets() {
        let limiter = limiter(1);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
        limiter.close();
    }

    #[tokio::test]
    async fn full_visitor_table_rejects_new_identities() {
        let limiter = RateLimiter::new(
            BucketConfig {
                requests: 1,
                duration: Duration::from_secs(60),
                burst: 1,
                expires_in: Duration::from_secs(120),
            },
            RateLimiterLimits {
                max_visitors: 1,
                ..RateLimiterLimits::default()
            },
        );

        assert!(limiter.allow("first"));
        assert!(!limiter.allow("second"));
        limiter.close();
    }

    #[tokio::test]
    async fn burst_zero_still_refills_over_time() {
        let limiter = RateLimiter::new(
            BucketConfig {
                requests: 1,
                duration: Duration::from_millis(50),
                burst: 0,
                expires_in: Duration::from_secs(120),
            },
            RateLimiterLimits::default(),
        );

        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow("1.2.3.4"));
        limiter.close();
    }
}

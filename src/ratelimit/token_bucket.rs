//! Token bucket.
//!
//! Each subject owns a bucket of at most `capacity` tokens that refills
//! continuously at `refill_rate` tokens per second. A request takes one
//! token, so bursts up to the capacity pass and the sustained rate is the
//! refill rate. Refill and take run as one atomic step at the store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::decision::{ceil_secs, Decision};
use super::key::KeyPrefix;
use super::policy::{BucketLimits, IDLE_REFILL_PERIODS};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{BucketRequest, Store};

/// Token bucket rate limiter.
pub struct TokenBucket {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    prefix: KeyPrefix,
}

impl TokenBucket {
    /// Prefix used when none is configured.
    pub const DEFAULT_PREFIX: &'static str = "token_bucket";

    /// Create a limiter storing its buckets under `prefix`.
    pub fn new(store: Arc<dyn Store>, prefix: KeyPrefix) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix,
        }
    }

    /// Replace the clock that drives refills.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refill the bucket for `key` and take one token if there is one.
    pub async fn check(&self, key: &str, limits: &BucketLimits) -> Result<Decision> {
        let store_key = self.prefix.key_for(key);
        let now = self.clock.now_millis();

        let request = BucketRequest {
            capacity: limits.capacity,
            refill_per_sec: limits.refill_rate,
            now_ms: now,
            ttl: idle_expiry(limits),
        };
        let state = self.store.take_token(&store_key, &request).await?;

        let remaining = (state.tokens.floor() as u64).min(limits.capacity);
        let count = limits.capacity - remaining;

        trace!(
            key = %store_key,
            tokens = state.tokens,
            capacity = limits.capacity,
            "Token bucket checked"
        );

        if state.allowed {
            let reset_at = if remaining >= limits.capacity {
                now
            } else {
                // Time until the next whole token lands.
                let missing = state.tokens.floor() + 1.0 - state.tokens;
                now + refill_millis(missing, limits.refill_rate)
            };
            return Ok(Decision::allow(limits.capacity, count, remaining, reset_at));
        }

        let wait_ms = refill_millis(1.0 - state.tokens, limits.refill_rate);
        debug!(
            key = %store_key,
            tokens = state.tokens,
            wait_ms,
            "Token bucket empty"
        );
        Ok(Decision::deny(
            limits.capacity,
            count,
            remaining,
            now + wait_ms,
            Duration::from_millis(wait_ms as u64),
        ))
    }

    /// Drop the bucket for `key`; the next check sees a full bucket.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(&self.prefix.key_for(key)).await
    }
}

/// Expiry of an idle bucket: ten full refill periods, in whole seconds.
fn idle_expiry(limits: &BucketLimits) -> Duration {
    Duration::from_secs(ceil_secs(limits.full_refill()).saturating_mul(IDLE_REFILL_PERIODS))
}

/// Milliseconds needed to refill `tokens` at `rate` tokens per second.
fn refill_millis(tokens: f64, rate: f64) -> i64 {
    (tokens.max(0.0) / rate * 1000.0).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use tokio_test::assert_ok;

    fn create_limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, TokenBucket) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = TokenBucket::new(
            store.clone(),
            KeyPrefix::new("upload_bucket").unwrap(),
        )
        .with_clock(clock.clone());
        (clock, store, limiter)
    }

    fn upload_limits() -> BucketLimits {
        BucketLimits::new(10, 1.0).unwrap()
    }

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let (_clock, _store, limiter) = create_limiter();
        let limits = upload_limits();

        for i in 1..=10 {
            let decision = limiter.check("user:1", &limits).await.unwrap();
            assert!(decision.allowed(), "Upload {} should be allowed", i);
            assert_eq!(decision.remaining(), 10 - i);
            assert_eq!(decision.limit(), 10);
        }

        let denied = limiter.check("user:1", &limits).await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.remaining(), 0);
        assert_eq!(denied.retry_after_secs(), Some(1));
    }

    #[tokio::test]
    async fn test_refills_at_configured_rate() {
        let (clock, _store, limiter) = create_limiter();
        let limits = upload_limits();

        for _ in 0..10 {
            limiter.check("user:1", &limits).await.unwrap();
        }
        assert!(!limiter.check("user:1", &limits).await.unwrap().allowed());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check("user:1", &limits).await.unwrap().allowed());
        assert!(!limiter.check("user:1", &limits).await.unwrap().allowed());

        clock.advance(Duration::from_secs(3));
        for _ in 0..3 {
            assert!(limiter.check("user:1", &limits).await.unwrap().allowed());
        }
        assert!(!limiter.check("user:1", &limits).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_capacity() {
        let (clock, _store, limiter) = create_limiter();
        let limits = BucketLimits::new(3, 1.0).unwrap();

        limiter.check("k", &limits).await.unwrap();
        clock.advance(Duration::from_secs(3_600));

        for _ in 0..3 {
            assert!(limiter.check("k", &limits).await.unwrap().allowed());
        }
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn test_fractional_refill_rate() {
        let (clock, _store, limiter) = create_limiter();
        let limits = BucketLimits::new(1, 0.5).unwrap();

        assert!(limiter.check("k", &limits).await.unwrap().allowed());
        let denied = limiter.check("k", &limits).await.unwrap();
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(2)));

        clock.advance(Duration::from_secs(1));
        let denied = limiter.check("k", &limits).await.unwrap();
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check("k", &limits).await.unwrap().allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_take_single_token() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(
            MemoryStore::with_clock(clock.clone()).with_latency(Duration::from_millis(20)),
        );
        let limiter = Arc::new(
            TokenBucket::new(store, KeyPrefix::new("upload_bucket").unwrap()).with_clock(clock),
        );
        let limits = BucketLimits::new(1, 0.001).unwrap();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("user:1", &limits).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().allowed() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_reset_on_clear_key_is_ok() {
        let (_clock, store, limiter) = create_limiter();
        assert_ok!(limiter.reset("never-seen").await);
        assert_ok!(limiter.reset("never-seen").await);
        assert!(store.is_empty());

        let decision = limiter.check("never-seen", &upload_limits()).await.unwrap();
        assert_eq!(decision.remaining(), 9);
    }

    #[tokio::test]
    async fn test_idle_bucket_expires() {
        let (_clock, store, limiter) = create_limiter();
        let limits = upload_limits();

        limiter.check("user:1", &limits).await.unwrap();
        assert_eq!(
            store.ttl("upload_bucket:user:1"),
            Some(Duration::from_secs(100))
        );
    }

    #[tokio::test]
    async fn test_reset_refills_bucket() {
        let (_clock, _store, limiter) = create_limiter();
        let limits = BucketLimits::new(2, 0.01).unwrap();

        limiter.check("k", &limits).await.unwrap();
        limiter.check("k", &limits).await.unwrap();
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());

        assert_ok!(limiter.reset("k").await);
        let decision = limiter.check("k", &limits).await.unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.remaining(), 1);
    }

    #[test]
    fn test_idle_expiry_rounds_refill_period_up() {
        assert_eq!(
            idle_expiry(&BucketLimits::new(10, 1.0).unwrap()),
            Duration::from_secs(100)
        );
        assert_eq!(
            idle_expiry(&BucketLimits::new(5, 2.0).unwrap()),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_idle_expiry_saturates_for_unvalidated_limits() {
        let limits = BucketLimits {
            capacity: 10,
            refill_rate: 1e-20,
        };
        assert_eq!(idle_expiry(&limits), Duration::from_secs(u64::MAX));
    }
}

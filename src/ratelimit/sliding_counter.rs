//! Sliding window counter.
//!
//! Approximates a trailing window with two adjacent fixed windows: the
//! previous window's count is weighted by the share of it still covered by
//! the trailing window, and the current window's count is added in full.
//! State per subject is a single small hash regardless of the limit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::decision::Decision;
use super::key::KeyPrefix;
use super::policy::WindowLimits;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{Store, WindowPairRequest};

/// Interpolating sliding window rate limiter.
pub struct SlidingWindowCounter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    prefix: KeyPrefix,
}

impl SlidingWindowCounter {
    /// Prefix used when none is configured.
    pub const DEFAULT_PREFIX: &'static str = "rate_limit";

    /// Create a limiter storing its window pairs under `prefix`.
    pub fn new(store: Arc<dyn Store>, prefix: KeyPrefix) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix,
        }
    }

    /// Replace the clock that places requests into windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Count one request for `key` if the weighted estimate leaves room.
    pub async fn check(&self, key: &str, limits: &WindowLimits) -> Result<Decision> {
        let store_key = self.prefix.key_for(key);
        let now = self.clock.now_millis();
        let window_ms = limits.window_ms as i64;

        let window_index = now.div_euclid(window_ms);
        let elapsed_ms = now.rem_euclid(window_ms);
        let previous_weight = 1.0 - elapsed_ms as f64 / window_ms as f64;

        let request = WindowPairRequest {
            window_index,
            previous_weight,
            limit: limits.limit,
            ttl: limits.window() * 2,
        };
        let pair = self.store.weighted_window(&store_key, &request).await?;

        let estimate = pair.previous as f64 * previous_weight + pair.current as f64;
        let count = estimate.ceil() as u64;
        let remaining = limits.limit.saturating_sub(count);

        trace!(
            key = %store_key,
            current = pair.current,
            previous = pair.previous,
            estimate,
            limit = limits.limit,
            "Sliding counter checked"
        );

        if pair.allowed {
            let window_end = (window_index + 1) * window_ms;
            return Ok(Decision::allow(limits.limit, count, remaining, window_end));
        }

        let wait_ms = wait_for_room(
            pair.previous,
            pair.current,
            limits.limit,
            elapsed_ms,
            window_ms,
        );
        debug!(
            key = %store_key,
            estimate,
            limit = limits.limit,
            wait_ms,
            "Sliding counter limit exceeded"
        );
        Ok(Decision::deny(
            limits.limit,
            count,
            remaining,
            now + wait_ms,
            Duration::from_millis(wait_ms as u64),
        ))
    }

    /// Drop the window pair for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(&self.prefix.key_for(key)).await
    }
}

/// Milliseconds until the weighted estimate drops far enough to admit one
/// more request, assuming no further admissions.
fn wait_for_room(previous: u64, current: u64, limit: u64, elapsed_ms: i64, window_ms: i64) -> i64 {
    let budget = limit.saturating_sub(1) as f64;
    let window = window_ms as f64;

    if (current as f64) <= budget && previous > 0 {
        // previous * (1 - f) + current <= budget, solved for the fraction f
        // of the current window that has to elapse.
        let fraction = 1.0 - (budget - current as f64) / previous as f64;
        return ((fraction * window).ceil() as i64 - elapsed_ms).max(1);
    }

    // The current window alone is over budget: wait for it to become the
    // previous window and decay far enough.
    let until_next = window_ms - elapsed_ms;
    let fraction = if current == 0 {
        0.0
    } else {
        (1.0 - budget / current as f64).max(0.0)
    };
    until_next + (fraction * window).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use tokio_test::assert_ok;

    // Aligned to a 10s window boundary.
    const START: i64 = 1_700_000_000_000;

    fn create_limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, SlidingWindowCounter) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = SlidingWindowCounter::new(
            store.clone(),
            KeyPrefix::new(SlidingWindowCounter::DEFAULT_PREFIX).unwrap(),
        )
        .with_clock(clock.clone());
        (clock, store, limiter)
    }

    fn limits() -> WindowLimits {
        WindowLimits::new(10, Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_allows_limit_within_one_window() {
        let (_clock, _store, limiter) = create_limiter();
        let limits = limits();

        for i in 1..=10 {
            let decision = limiter.check("user:7", &limits).await.unwrap();
            assert!(decision.allowed(), "Request {} should be allowed", i);
            assert_eq!(decision.remaining(), 10 - i);
            assert_eq!(decision.reset_at_ms(), START + 10_000);
        }

        let denied = limiter.check("user:7", &limits).await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.count(), 10);
        // One full window to roll over, then a tenth of the next for the
        // previous count to decay below the limit.
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(11_000)));
    }

    #[tokio::test]
    async fn test_previous_window_is_weighted_by_overlap() {
        let (clock, _store, limiter) = create_limiter();
        let limits = limits();

        for _ in 0..10 {
            limiter.check("k", &limits).await.unwrap();
        }

        // Start of the next window: the previous count weighs in fully.
        clock.set(START + 10_000);
        let denied = limiter.check("k", &limits).await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(1_000)));

        // A tenth in, the estimate is 9 and one more request fits.
        clock.set(START + 11_000);
        assert!(limiter.check("k", &limits).await.unwrap().allowed());
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());

        // Halfway in, the estimate is 10 * 0.5 + 1 = 6: four more fit.
        clock.set(START + 15_000);
        for _ in 0..4 {
            assert!(limiter.check("k", &limits).await.unwrap().allowed());
        }
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn test_denied_requests_are_not_counted() {
        let (clock, _store, limiter) = create_limiter();
        let limits = WindowLimits::new(2, Duration::from_secs(10)).unwrap();

        limiter.check("k", &limits).await.unwrap();
        limiter.check("k", &limits).await.unwrap();
        for _ in 0..20 {
            assert!(!limiter.check("k", &limits).await.unwrap().allowed());
        }

        // Two windows later nothing is left, however many were denied.
        clock.set(START + 20_000);
        let decision = limiter.check("k", &limits).await.unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.count(), 1);
    }

    #[tokio::test]
    async fn test_state_expires_after_two_windows() {
        let (_clock, store, limiter) = create_limiter();
        let limits = limits();

        limiter.check("k", &limits).await.unwrap();
        assert_eq!(store.ttl("rate_limit:k"), Some(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn test_reset_clears_both_windows() {
        let (clock, _store, limiter) = create_limiter();
        let limits = WindowLimits::new(1, Duration::from_secs(10)).unwrap();

        limiter.check("k", &limits).await.unwrap();
        clock.set(START + 10_000);
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());

        assert_ok!(limiter.reset("k").await);
        assert!(limiter.check("k", &limits).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn test_reset_on_clear_key_is_ok() {
        let (_clock, store, limiter) = create_limiter();
        assert_ok!(limiter.reset("never-seen").await);
        assert_ok!(limiter.reset("never-seen").await);
        assert!(store.is_empty());
    }

    #[test]
    fn test_wait_for_room() {
        // Previous window decays: 10 * (1 - f) <= 9 needs f >= 0.1.
        assert_eq!(wait_for_room(10, 0, 10, 0, 10_000), 1_000);
        assert_eq!(wait_for_room(10, 0, 10, 400, 10_000), 600);
        // Current window is full: roll over, then decay.
        assert_eq!(wait_for_room(0, 10, 10, 2_000, 10_000), 9_000);
        // Limit of one: the previous window must have decayed entirely.
        assert_eq!(wait_for_room(0, 1, 1, 0, 10_000), 20_000);
    }
}

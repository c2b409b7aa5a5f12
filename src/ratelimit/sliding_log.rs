//! Sliding window log.
//!
//! Keeps one timestamped entry per admitted request and counts the entries
//! inside the trailing window. Exact, at the cost of memory proportional to
//! the limit per subject.

use std::sync::Arc;

use tracing::{debug, trace};

use super::decision::{millis_until, Decision};
use super::key::KeyPrefix;
use super::policy::WindowLimits;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{LogEntry, Store};

/// Sliding log rate limiter.
pub struct SlidingWindowLog {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    prefix: KeyPrefix,
}

impl SlidingWindowLog {
    /// Prefix used when none is configured.
    pub const DEFAULT_PREFIX: &'static str = "chat_rate";

    /// Create a limiter storing its logs under `prefix`.
    pub fn new(store: Arc<dyn Store>, prefix: KeyPrefix) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix,
        }
    }

    /// Replace the clock used for log timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record one request for `key` and decide whether the trailing window
    /// still holds no more than `limits.limit` entries.
    ///
    /// A denied request leaves no entry behind.
    pub async fn check(&self, key: &str, limits: &WindowLimits) -> Result<Decision> {
        let store_key = self.prefix.key_for(key);
        let now = self.clock.now_millis();
        let window_ms = limits.window_ms as i64;
        let entry = LogEntry::new(now);

        let snapshot = self
            .store
            .append_log(&store_key, &entry, limits.window(), Some(limits.limit))
            .await?;

        let reset_at = snapshot.oldest_ms.unwrap_or(now) + window_ms;

        trace!(
            key = %store_key,
            count = snapshot.count,
            limit = limits.limit,
            "Sliding log checked"
        );

        if !snapshot.rolled_back {
            let remaining = limits.limit.saturating_sub(snapshot.count);
            return Ok(Decision::allow(limits.limit, snapshot.count, remaining, reset_at));
        }

        debug!(key = %store_key, limit = limits.limit, "Sliding log limit exceeded");
        Ok(Decision::deny(
            limits.limit,
            snapshot.count - 1,
            0,
            reset_at,
            millis_until(now, reset_at),
        ))
    }

    /// Number of requests counted in the trailing window for `key`, without
    /// recording a new one.
    pub async fn usage(&self, key: &str, limits: &WindowLimits) -> Result<u64> {
        let store_key = self.prefix.key_for(key);
        let now = self.clock.now_millis();

        let snapshot = self
            .store
            .peek_log(&store_key, limits.window(), now)
            .await?;
        Ok(snapshot.count)
    }

    /// Drop the log for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(&self.prefix.key_for(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn create_limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, SlidingWindowLog) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = SlidingWindowLog::new(
            store.clone(),
            KeyPrefix::new(SlidingWindowLog::DEFAULT_PREFIX).unwrap(),
        )
        .with_clock(clock.clone());
        (clock, store, limiter)
    }

    fn chat_limits() -> WindowLimits {
        WindowLimits::new(20, Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_denied_requests_leave_no_entry() {
        let (_clock, store, limiter) = create_limiter();
        let limits = chat_limits();

        for i in 1..=20 {
            let decision = limiter.check("conn:abc", &limits).await.unwrap();
            assert!(decision.allowed(), "Message {} should be allowed", i);
            assert_eq!(decision.remaining(), 20 - i);
        }

        for _ in 0..5 {
            let decision = limiter.check("conn:abc", &limits).await.unwrap();
            assert!(!decision.allowed());
            assert_eq!(decision.count(), 20);
            assert_eq!(decision.remaining(), 0);
        }

        assert_eq!(store.log_members("chat_rate:conn:abc").len(), 20);
        assert_eq!(limiter.usage("conn:abc", &limits).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_entries_age_out_of_the_window() {
        let (clock, _store, limiter) = create_limiter();
        let limits = chat_limits();

        for _ in 0..20 {
            limiter.check("conn:abc", &limits).await.unwrap();
        }
        assert!(!limiter.check("conn:abc", &limits).await.unwrap().allowed());

        clock.advance(Duration::from_millis(10_001));
        let decision = limiter.check("conn:abc", &limits).await.unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.count(), 1);
        assert_eq!(limiter.usage("conn:abc", &limits).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trailing_window_is_exact() {
        let (clock, _store, limiter) = create_limiter();
        let limits = WindowLimits::new(3, Duration::from_secs(10)).unwrap();

        limiter.check("k", &limits).await.unwrap();
        clock.advance(Duration::from_secs(4));
        limiter.check("k", &limits).await.unwrap();
        limiter.check("k", &limits).await.unwrap();

        // Oldest entry is still inside the window.
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());

        // Oldest entry has just left it; the other two remain.
        clock.advance(Duration::from_millis(1_001));
        let decision = limiter.check("k", &limits).await.unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.count(), 3);
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn test_retry_after_tracks_oldest_entry() {
        let (clock, _store, limiter) = create_limiter();
        let limits = WindowLimits::new(2, Duration::from_secs(10)).unwrap();

        let first = limiter.check("k", &limits).await.unwrap();
        assert_eq!(first.reset_at_ms(), clock.now_millis() + 10_000);

        clock.advance(Duration::from_millis(2_500));
        limiter.check("k", &limits).await.unwrap();

        let denied = limiter.check("k", &limits).await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(7_500)));
        assert_eq!(denied.retry_after_secs(), Some(8));
        assert_eq!(denied.reset_at_ms(), clock.now_millis() + 7_500);
    }

    #[tokio::test]
    async fn test_usage_does_not_record() {
        let (_clock, _store, limiter) = create_limiter();
        let limits = chat_limits();

        assert_eq!(limiter.usage("k", &limits).await.unwrap(), 0);
        limiter.check("k", &limits).await.unwrap();
        assert_eq!(limiter.usage("k", &limits).await.unwrap(), 1);
        assert_eq!(limiter.usage("k", &limits).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_log() {
        let (_clock, _store, limiter) = create_limiter();
        let limits = WindowLimits::new(1, Duration::from_secs(10)).unwrap();

        limiter.check("k", &limits).await.unwrap();
        assert!(!limiter.check("k", &limits).await.unwrap().allowed());

        assert_ok!(limiter.reset("k").await);
        assert_ok!(limiter.reset("k").await);
        assert!(limiter.check("k", &limits).await.unwrap().allowed());
    }
}

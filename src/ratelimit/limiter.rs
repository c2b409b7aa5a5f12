//! Policy-bound rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::decision::Decision;
use super::fixed_window::FixedWindowCounter;
use super::policy::{Algorithm, BucketLimits, Policy, WindowLimits};
use super::sliding_counter::SlidingWindowCounter;
use super::sliding_log::SlidingWindowLog;
use super::token_bucket::TokenBucket;
use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};
use crate::store::Store;

/// Default upper bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

enum Engine {
    FixedWindow(FixedWindowCounter, WindowLimits),
    SlidingLog(SlidingWindowLog, WindowLimits),
    SlidingCounter(SlidingWindowCounter, WindowLimits),
    TokenBucket(TokenBucket, BucketLimits),
}

/// A rate limiter bound to one [`Policy`].
///
/// Every store call is bounded by a timeout; an expired timeout surfaces as
/// [`FloodgateError::Timeout`], which callers treat like any other store
/// failure.
pub struct RateLimiter {
    engine: Engine,
    policy: Policy,
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl RateLimiter {
    /// Build a limiter for `policy` on top of `store`.
    ///
    /// Fails when the policy is misconfigured.
    pub fn new(store: Arc<dyn Store>, policy: Policy) -> Result<Self> {
        Self::with_clock(store, Arc::new(SystemClock), policy)
    }

    /// Build a limiter whose timestamps come from `clock`.
    pub fn with_clock(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        policy: Policy,
    ) -> Result<Self> {
        policy.validate()?;
        let prefix = policy.key_prefix()?;

        let engine = match policy.algorithm {
            Algorithm::FixedWindow(limits) => Engine::FixedWindow(
                FixedWindowCounter::new(store.clone(), prefix).with_clock(clock),
                limits,
            ),
            Algorithm::SlidingLog(limits) => Engine::SlidingLog(
                SlidingWindowLog::new(store.clone(), prefix).with_clock(clock),
                limits,
            ),
            Algorithm::SlidingCounter(limits) => Engine::SlidingCounter(
                SlidingWindowCounter::new(store.clone(), prefix).with_clock(clock),
                limits,
            ),
            Algorithm::TokenBucket(limits) => Engine::TokenBucket(
                TokenBucket::new(store.clone(), prefix).with_clock(clock),
                limits,
            ),
        };

        debug!(
            prefix = %policy.prefix,
            algorithm = policy.algorithm.name(),
            limit = policy.algorithm.limit(),
            "Created rate limiter"
        );

        Ok(Self {
            engine,
            policy,
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    /// Replace the store round-trip timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Count one request for `key` and decide whether it is admitted.
    pub async fn check(&self, key: &str) -> Result<Decision> {
        trace!(prefix = %self.policy.prefix, key = %key, "Checking rate limit");

        match &self.engine {
            Engine::FixedWindow(limiter, limits) => self.bounded(limiter.check(key, limits)).await,
            Engine::SlidingLog(limiter, limits) => self.bounded(limiter.check(key, limits)).await,
            Engine::SlidingCounter(limiter, limits) => {
                self.bounded(limiter.check(key, limits)).await
            }
            Engine::TokenBucket(limiter, limits) => self.bounded(limiter.check(key, limits)).await,
        }
    }

    /// Forget all state for `key` under this limiter's prefix.
    pub async fn reset(&self, key: &str) -> Result<()> {
        match &self.engine {
            Engine::FixedWindow(limiter, _) => self.bounded(limiter.reset(key)).await,
            Engine::SlidingLog(limiter, _) => self.bounded(limiter.reset(key)).await,
            Engine::SlidingCounter(limiter, _) => self.bounded(limiter.reset(key)).await,
            Engine::TokenBucket(limiter, _) => self.bounded(limiter.reset(key)).await,
        }
    }

    /// Requests recorded for `key` in the trailing window.
    ///
    /// Only sliding logs keep an exact per-request record; other algorithms
    /// return `None`.
    pub async fn usage(&self, key: &str) -> Result<Option<u64>> {
        match &self.engine {
            Engine::SlidingLog(limiter, limits) => {
                self.bounded(limiter.usage(key, limits)).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Check that the backing store answers within the timeout.
    pub async fn ping(&self) -> Result<()> {
        self.bounded(self.store.ping()).await
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| FloodgateError::Timeout(self.timeout))?
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(&self, key: &str) -> Result<Decision> {
        RateLimiter::check(self, key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        RateLimiter::reset(self, key).await
    }
}

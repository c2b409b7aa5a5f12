//! Rate limiter trait for abstracting over algorithms and stores.

use async_trait::async_trait;

use super::decision::Decision;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The admission gates depend only on this capability, so any algorithm,
/// or a test double, can sit behind them.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `key` and decide whether it is admitted.
    async fn check(&self, key: &str) -> Result<Decision>;

    /// Forget all state for `key`. Succeeds when there is nothing to forget.
    async fn reset(&self, key: &str) -> Result<()>;
}

//! Fixed window counter.
//!
//! One integer counter per subject. The bucket starts with the first request
//! after the previous counter expired, not on a wall-clock boundary, so two
//! bursts straddling a bucket edge can together exceed the limit within a
//! shorter interval. That edge effect is the price of O(1) state.

use std::sync::Arc;

use tracing::{debug, trace};

use super::decision::Decision;
use super::key::KeyPrefix;
use super::policy::WindowLimits;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{duration_millis, Store};

/// Fixed window rate limiter.
pub struct FixedWindowCounter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    prefix: KeyPrefix,
}

impl FixedWindowCounter {
    /// Prefix used when none is configured.
    pub const DEFAULT_PREFIX: &'static str = "fixed_limit";

    /// Create a limiter storing its counters under `prefix`.
    pub fn new(store: Arc<dyn Store>, prefix: KeyPrefix) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix,
        }
    }

    /// Replace the clock used for reset timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Count one request for `key` and decide whether it is within `limits`.
    pub async fn check(&self, key: &str, limits: &WindowLimits) -> Result<Decision> {
        let store_key = self.prefix.key_for(key);
        let now = self.clock.now_millis();

        let counter = self.store.incr_window(&store_key, limits.window()).await?;
        let remaining = limits.limit.saturating_sub(counter.count);
        let reset_at = now + duration_millis(counter.ttl);

        trace!(
            key = %store_key,
            count = counter.count,
            limit = limits.limit,
            ttl_ms = counter.ttl.as_millis() as u64,
            "Fixed window checked"
        );

        if counter.count <= limits.limit {
            return Ok(Decision::allow(limits.limit, counter.count, remaining, reset_at));
        }

        debug!(
            key = %store_key,
            count = counter.count,
            limit = limits.limit,
            "Fixed window limit exceeded"
        );
        Ok(Decision::deny(
            limits.limit,
            counter.count,
            remaining,
            reset_at,
            counter.ttl,
        ))
    }

    /// Drop the counter for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(&self.prefix.key_for(key)).await
    }
}

//! Shared state store used by the limiters.
//!
//! All window state lives in the store and is never cached in-process across
//! checks. Every method on [`Store`] is a single atomic unit at the store, so
//! concurrent checks against the same key are serialized there.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Post-increment state of a fixed window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// Counter value after this increment
    pub count: u64,
    /// Time left before the counter expires
    pub ttl: Duration,
}

/// One timestamped entry in a sliding log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Score of the entry (milliseconds since epoch)
    pub score_ms: i64,
    /// Member value, unique across concurrent callers
    pub member: String,
}

impl LogEntry {
    /// Build an entry for `now_ms` with a random discriminator.
    ///
    /// Two callers can observe the same millisecond, so the timestamp alone
    /// would collapse their entries into one set member.
    pub fn new(now_ms: i64) -> Self {
        Self {
            score_ms: now_ms,
            member: format!("{}-{:016x}", now_ms, rand::random::<u64>()),
        }
    }
}

/// State of a sliding log after pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogSnapshot {
    /// Entries counted in the window, including the one just appended
    pub count: u64,
    /// Score of the oldest surviving entry
    pub oldest_ms: Option<i64>,
    /// Whether the appended entry was removed again because the limit was exceeded
    pub rolled_back: bool,
}

/// Input for one interpolated sliding counter step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPairRequest {
    /// Index of the fixed window containing `now`
    pub window_index: i64,
    /// Weight applied to the previous window's count
    pub previous_weight: f64,
    /// Maximum weighted count
    pub limit: u64,
    /// Expiry of the whole pair
    pub ttl: Duration,
}

/// Counters of the current and previous fixed windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowPair {
    /// Admitted requests in the current window (after this step)
    pub current: u64,
    /// Admitted requests in the previous window
    pub previous: u64,
    /// Whether this step counted a new request
    pub allowed: bool,
}

/// Input for one token bucket refill-and-take step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRequest {
    /// Maximum number of tokens
    pub capacity: u64,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Current time in milliseconds since epoch
    pub now_ms: i64,
    /// Idle expiry of the bucket
    pub ttl: Duration,
}

/// Bucket state after a refill-and-take step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BucketState {
    /// Fractional token count left in the bucket
    pub tokens: f64,
    /// Whether a token was taken
    pub allowed: bool,
}

/// Atomic primitives the limiters need from the shared store.
///
/// Implementations must execute each method as one indivisible unit so that
/// checks from any number of replicas see a consistent view.
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment a fixed window counter, arming its expiry on the first hit.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCounter>;

    /// Prune, append, count and refresh a sliding log.
    ///
    /// With `rollback_above` set, the appended entry is removed again when the
    /// count exceeds it.
    async fn append_log(
        &self,
        key: &str,
        entry: &LogEntry,
        window: Duration,
        rollback_above: Option<u64>,
    ) -> Result<LogSnapshot>;

    /// Prune and count a sliding log without appending.
    async fn peek_log(&self, key: &str, window: Duration, now_ms: i64) -> Result<LogSnapshot>;

    /// Roll the window pair forward and count the request if the weighted
    /// estimate leaves room for it.
    async fn weighted_window(&self, key: &str, request: &WindowPairRequest) -> Result<WindowPair>;

    /// Refill a token bucket and take one token if available.
    async fn take_token(&self, key: &str, request: &BucketRequest) -> Result<BucketState>;

    /// Delete all state stored under `key`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Whole seconds covering `window`, at least one.
pub(crate) fn expiry_seconds(window: Duration) -> u64 {
    let millis = window.as_millis().max(1);
    u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
}

/// Milliseconds in `duration`, saturating.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

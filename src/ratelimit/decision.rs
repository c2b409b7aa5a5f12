//! Admission decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// The verdict of one `check` plus the quota metadata shown to callers.
///
/// `retry_after` is present exactly when the request is denied; the
/// constructors are the only way to build a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    limit: u64,
    count: u64,
    remaining: u64,
    reset_at_ms: i64,
    retry_after: Option<Duration>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(limit: u64, count: u64, remaining: u64, reset_at_ms: i64) -> Self {
        Self {
            allowed: true,
            limit,
            count,
            remaining,
            reset_at_ms,
            retry_after: None,
        }
    }

    /// A denied request and how long the caller should wait.
    pub fn deny(
        limit: u64,
        count: u64,
        remaining: u64,
        reset_at_ms: i64,
        retry_after: Duration,
    ) -> Self {
        Self {
            allowed: false,
            limit,
            count,
            remaining,
            reset_at_ms,
            retry_after: Some(retry_after),
        }
    }

    /// Whether the operation may proceed.
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Configured limit (or bucket capacity).
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Units consumed in the current window or bucket.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Units left in the current window or bucket.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Milliseconds since epoch at which the state next changes favorably.
    pub fn reset_at_ms(&self) -> i64 {
        self.reset_at_ms
    }

    /// [`Self::reset_at_ms`] as a timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.reset_at_ms).unwrap_or_default()
    }

    /// How long to wait before retrying; `None` when allowed.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// [`Self::retry_after`] rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }
}

/// Round a duration up to whole seconds.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Duration from a millisecond difference, clamped at zero.
pub(crate) fn millis_until(from_ms: i64, to_ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(to_ms - from_ms).unwrap_or(0))
}

//! Limit policies.
//!
//! A policy selects one algorithm and carries the limits it is checked
//! against, the key prefix of its state, and the message shown on denial.
//! Policies are validated when limiters are built, never at request time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::KeyPrefix;
use crate::error::{FloodgateError, Result};

/// Longest key expiry any policy may ask the store for, in seconds.
///
/// Sliding counters keep state for two windows and idle token buckets for
/// ten refill periods; both must stay under this bound.
pub const MAX_EXPIRY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Limits for the window-based algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    /// Maximum requests per window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl WindowLimits {
    /// Build validated window limits.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        let limits = Self {
            limit,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Reject zero limits, empty windows and windows the store cannot expire.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(FloodgateError::Config("limit must be > 0".to_string()));
        }
        if self.window_ms == 0 {
            return Err(FloodgateError::Config("window_ms must be > 0".to_string()));
        }
        if self.window_ms > MAX_EXPIRY_SECS * 1000 / 2 {
            return Err(FloodgateError::Config(format!(
                "window_ms must be at most {}",
                MAX_EXPIRY_SECS * 1000 / 2
            )));
        }
        Ok(())
    }
}

/// Idle buckets are kept this many full refill periods before expiring.
pub(crate) const IDLE_REFILL_PERIODS: u64 = 10;

/// Limits for the token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimits {
    /// Maximum tokens held (burst size)
    pub capacity: u64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketLimits {
    /// Build validated bucket limits.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self> {
        let limits = Self {
            capacity,
            refill_rate,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Time for an empty bucket to fill up, saturating at [`Duration::MAX`].
    pub fn full_refill(&self) -> Duration {
        Duration::try_from_secs_f64(self.capacity as f64 / self.refill_rate)
            .unwrap_or(Duration::MAX)
    }

    /// Reject empty buckets, non-positive or non-finite refill rates, and
    /// buckets refilling too slowly for their idle state to be expired.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(FloodgateError::Config("capacity must be > 0".to_string()));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(FloodgateError::Config(
                "refill_rate must be a positive number".to_string(),
            ));
        }
        let refill_secs = (self.capacity as f64 / self.refill_rate).ceil();
        if refill_secs * IDLE_REFILL_PERIODS as f64 > MAX_EXPIRY_SECS as f64 {
            return Err(FloodgateError::Config(format!(
                "capacity / refill_rate must be at most {} seconds",
                MAX_EXPIRY_SECS / IDLE_REFILL_PERIODS
            )));
        }
        Ok(())
    }
}

/// Algorithm selection together with its limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// Single counter per bucket, anchored to the first request
    FixedWindow(WindowLimits),
    /// Exact log of timestamps in the trailing window
    SlidingLog(WindowLimits),
    /// Two adjacent fixed windows with linear interpolation
    SlidingCounter(WindowLimits),
    /// Continuously refilling allowance
    TokenBucket(BucketLimits),
}

impl Algorithm {
    /// The quota advertised to callers: the window limit or bucket capacity.
    pub fn limit(&self) -> u64 {
        match self {
            Algorithm::FixedWindow(l) | Algorithm::SlidingLog(l) | Algorithm::SlidingCounter(l) => {
                l.limit
            }
            Algorithm::TokenBucket(b) => b.capacity,
        }
    }

    /// Short algorithm name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow(_) => "fixed_window",
            Algorithm::SlidingLog(_) => "sliding_log",
            Algorithm::SlidingCounter(_) => "sliding_counter",
            Algorithm::TokenBucket(_) => "token_bucket",
        }
    }

    /// Validate the limits of the selected algorithm.
    pub fn validate(&self) -> Result<()> {
        match self {
            Algorithm::FixedWindow(l) | Algorithm::SlidingLog(l) | Algorithm::SlidingCounter(l) => {
                l.validate()
            }
            Algorithm::TokenBucket(b) => b.validate(),
        }
    }
}

/// A named limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Key prefix of this policy's state; distinct per policy
    pub prefix: String,
    /// Algorithm and limits
    #[serde(flatten)]
    pub algorithm: Algorithm,
    /// Human-readable denial message
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "Too many requests. Please try again later.".to_string()
}

impl Policy {
    /// Create a policy with the default denial message.
    pub fn new(prefix: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            prefix: prefix.into(),
            algorithm,
            message: default_message(),
        }
    }

    /// Replace the denial message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Validated key prefix.
    pub fn key_prefix(&self) -> Result<KeyPrefix> {
        KeyPrefix::new(self.prefix.clone())
    }

    /// Validate the prefix and limits.
    pub fn validate(&self) -> Result<()> {
        self.key_prefix()?;
        self.algorithm.validate()
    }
}

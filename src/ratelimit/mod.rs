//! Rate limiting algorithms and the policy-bound limiter.

mod backend;
mod decision;
mod fixed_window;
mod key;
mod limiter;
mod policy;
mod sliding_counter;
mod sliding_log;
mod token_bucket;

pub use backend::RateLimiterBackend;
pub use decision::Decision;
pub use fixed_window::FixedWindowCounter;
pub use key::{KeyPrefix, Subject};
pub use limiter::{RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use policy::{Algorithm, BucketLimits, Policy, WindowLimits};
pub use sliding_counter::SlidingWindowCounter;
pub use sliding_log::SlidingWindowLog;
pub use token_bucket::TokenBucket;

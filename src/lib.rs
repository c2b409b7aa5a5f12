//! Floodgate - Redis-backed request admission
//!
//! This crate decides whether an incoming request or message may proceed
//! based on how many the same subject has recently made. Four algorithms
//! (fixed window, sliding log, sliding counter, token bucket) keep their
//! state in a shared store, so every replica of a service enforces one
//! quota. Admission gates render the decisions for HTTP and for message
//! transports, and admit traffic when the store is unavailable.

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;

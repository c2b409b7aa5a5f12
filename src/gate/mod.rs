//! Admission gates in front of request handlers and message transports.
//!
//! Both gates derive a subject from the caller, ask a
//! [`RateLimiterBackend`] for a decision, and render the outcome for their
//! transport. When the store cannot be reached the request is admitted.

mod http;
mod message;

pub use self::http::{
    admit_request, DenialBody, HttpGate, RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET,
};
pub use self::message::{ConnectionGate, GateEvent, MessageGate, RateLimitExceeded};

use chrono::SecondsFormat;
use tracing::{error, warn};

use crate::ratelimit::{Decision, RateLimiterBackend, Subject};

/// Identity attached to a request by the authentication layer.
///
/// Inserted as a request extension; takes precedence over the client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Outcome of asking a limiter about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Within quota
    Allowed(Decision),
    /// Over quota
    Denied(Decision),
    /// The limiter failed; the request proceeds without quota metadata
    FailedOpen,
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied(_))
    }
}

/// Ask `limiter` about one request from `subject`, failing open on errors.
pub async fn admit(limiter: &dyn RateLimiterBackend, subject: &Subject) -> Admission {
    let key = subject.to_string();

    match limiter.check(&key).await {
        Ok(decision) if decision.allowed() => Admission::Allowed(decision),
        Ok(decision) => Admission::Denied(decision),
        Err(e) if e.is_store_failure() => {
            warn!(subject = %key, error = %e, "Rate limit store unavailable, admitting request");
            Admission::FailedOpen
        }
        Err(e) => {
            error!(subject = %key, error = %e, "Rate limit check failed, admitting request");
            Admission::FailedOpen
        }
    }
}

/// Reset time as an RFC 3339 timestamp with millisecond precision.
pub(crate) fn reset_time(decision: &Decision) -> String {
    decision
        .reset_at()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

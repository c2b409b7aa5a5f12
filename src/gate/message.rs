//! Message gate for persistent connections.
//!
//! A connection gets its own [`ConnectionGate`] when it is established. The
//! transport asks [`ConnectionGate::allow`] before handling each inbound
//! message; on denial the client is told through the connection's event
//! channel and the message is dropped.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{admit, Admission};
use crate::ratelimit::{RateLimiter, RateLimiterBackend, Subject};

/// Payload of a `rate_limit_exceeded` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceeded {
    pub message: String,
    /// Whole seconds until the next message would be accepted
    pub retry_after: u64,
}

/// Events the gate pushes to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GateEvent {
    RateLimitExceeded(RateLimitExceeded),
}

/// Shared gate configuration, one per transport.
#[derive(Clone)]
pub struct MessageGate {
    limiter: Arc<dyn RateLimiterBackend>,
    message: Arc<str>,
}

impl MessageGate {
    /// Gate messages through `limiter`, notifying denials with `message`.
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, message: impl Into<String>) -> Self {
        Self {
            limiter,
            message: Arc::from(message.into()),
        }
    }

    /// Gate messages through a policy-bound limiter, using its denial message.
    pub fn for_limiter(limiter: Arc<RateLimiter>) -> Self {
        let message = limiter.policy().message.clone();
        Self::new(limiter, message)
    }

    /// Create the gate for one connection.
    ///
    /// Denial events are sent to `events`; a closed channel is not an error.
    pub fn attach(
        &self,
        subject: Subject,
        events: mpsc::UnboundedSender<GateEvent>,
    ) -> ConnectionGate {
        debug!(subject = %subject, "Attached message gate");
        ConnectionGate {
            limiter: self.limiter.clone(),
            message: self.message.clone(),
            subject,
            events,
        }
    }
}

impl std::fmt::Debug for MessageGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageGate")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Per-connection admission predicate.
pub struct ConnectionGate {
    limiter: Arc<dyn RateLimiterBackend>,
    message: Arc<str>,
    subject: Subject,
    events: mpsc::UnboundedSender<GateEvent>,
}

impl ConnectionGate {
    /// The subject this connection is limited as.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Whether the next inbound message may be handled.
    ///
    /// Returns `true` when the store is unavailable.
    pub async fn allow(&self) -> bool {
        match admit(self.limiter.as_ref(), &self.subject).await {
            Admission::Allowed(_) | Admission::FailedOpen => true,
            Admission::Denied(decision) => {
                let event = GateEvent::RateLimitExceeded(RateLimitExceeded {
                    message: self.message.to_string(),
                    retry_after: decision.retry_after_secs().unwrap_or(0),
                });
                if self.events.send(event).is_err() {
                    debug!(subject = %self.subject, "Connection closed before rate limit event");
                }
                false
            }
        }
    }
}

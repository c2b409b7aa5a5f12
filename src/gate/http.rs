//! HTTP admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::debug;

use super::{admit, reset_time, Admission, AuthenticatedUser};
use crate::ratelimit::{Decision, RateLimiter, RateLimiterBackend, Subject};

/// Configured quota.
pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
/// Quota left in the current window or bucket.
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
/// When the quota next changes favorably, RFC 3339.
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub error: String,
    pub message: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: String,
    pub retry_after: u64,
}

/// Rate limiting in front of HTTP handlers.
///
/// Install with `axum::middleware::from_fn_with_state(gate, admit_request)`.
/// Routes need the client address, so serve the router with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
#[derive(Clone)]
pub struct HttpGate {
    limiter: Arc<dyn RateLimiterBackend>,
    message: Arc<str>,
}

impl HttpGate {
    /// Gate requests through `limiter`, answering denials with `message`.
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, message: impl Into<String>) -> Self {
        Self {
            limiter,
            message: Arc::from(message.into()),
        }
    }

    /// Gate requests through a policy-bound limiter, using its denial message.
    pub fn for_limiter(limiter: Arc<RateLimiter>) -> Self {
        let message = limiter.policy().message.clone();
        Self::new(limiter, message)
    }

    /// Denial message shown to callers.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Build the 429 response for a denied request.
    pub fn denial_response(&self, decision: &Decision) -> Response {
        let retry_after = decision.retry_after_secs().unwrap_or(0);
        let body = DenialBody {
            error: "Too Many Requests".to_string(),
            message: self.message.to_string(),
            limit: decision.limit(),
            remaining: decision.remaining(),
            reset_time: reset_time(decision),
            retry_after,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        apply_quota_headers(headers, decision);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

impl std::fmt::Debug for HttpGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGate")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Middleware admitting or rejecting one request.
pub async fn admit_request(State(gate): State<HttpGate>, request: Request, next: Next) -> Response {
    let Some(subject) = request_subject(&request) else {
        debug!(uri = %request.uri(), "No subject for request, skipping rate limit");
        return next.run(request).await;
    };

    match admit(gate.limiter.as_ref(), &subject).await {
        Admission::Allowed(decision) => {
            let mut response = next.run(request).await;
            apply_quota_headers(response.headers_mut(), &decision);
            response
        }
        Admission::Denied(decision) => {
            debug!(subject = %subject, uri = %request.uri(), "Request rate limited");
            gate.denial_response(&decision)
        }
        Admission::FailedOpen => next.run(request).await,
    }
}

/// The authenticated user if present, else the client address.
fn request_subject(request: &Request) -> Option<Subject> {
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.as_str());
    let address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    Subject::resolve(user, address, None)
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit()));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    if let Ok(reset) = HeaderValue::from_str(&reset_time(decision)) {
        headers.insert(RATELIMIT_RESET, reset);
    }
}

//! axum adapter: identifies the caller, asks the limiter, and maps the
//! verdict onto rate limit headers or a 429.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, warn};

use crate::limiter::{RateLimiter, Verdict};

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Derives the quota identity for a request
pub type IdentityExtractor = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// State for [`rate_limit_middleware`]
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    identity: IdentityExtractor,
}

impl RateLimitState {
    /// Limit by client IP
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self::with_identity(limiter, Arc::new(client_ip))
    }

    /// Limit by a custom identity such as a user id or API token
    pub fn with_identity(limiter: Arc<RateLimiter>, identity: IdentityExtractor) -> Self {
        Self { limiter, identity }
    }
}

/// Client IP: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer
/// address when the server was started with connect info.
pub fn client_ip(request: &Request) -> Option<String> {
    let headers = request.headers();

    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real_ip = header_str(headers, "x-real-ip")
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Rate limit middleware for `axum::middleware::from_fn_with_state`
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(identity) = (state.identity)(&request) else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "unable to identify client" })),
        )
            .into_response();
    };
    let path = request.uri().path().to_string();
    let now = Utc::now();

    let verdict = match state.limiter.allow_at(&identity, &path, now).await {
        Ok(verdict) => verdict,
        Err(e) if e.is_store_failure() => {
            warn!("Rate limit store failure: {}, identity: {}, path: {}", e, identity, path);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(e) => {
            error!("Rate limit check failed: {}, identity: {}, path: {}", e, identity, path);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if !verdict.allowed {
        let retry_after = verdict.retry_after_secs(now);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "retry_after": retry_after,
            })),
        )
            .into_response();
        insert_quota_headers(response.headers_mut(), &verdict);
        response
            .headers_mut()
            .insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    insert_quota_headers(response.headers_mut(), &verdict);
    response
}

/// Unlimited and fail-open verdicts carry no reset time and get no headers
fn insert_quota_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    let Some(reset_at) = verdict.reset_at else {
        return;
    };
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at.timestamp()));
}

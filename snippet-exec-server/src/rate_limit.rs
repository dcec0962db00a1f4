//! Per-client rate limiting for the API surface

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use snippet_exec::{RateLimitDecision, RateLimiter};
use std::{net::SocketAddr, sync::Arc};
use tracing::debug;

use crate::error::ServerError;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Identifier requests are counted under, usually the caller's IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// Values rendered into the `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Unix milliseconds
    pub reset_at: u64,
}

impl From<&RateLimitDecision> for RateLimitHeaders {
    fn from(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        }
    }
}

pub fn insert_rate_limit_headers(headers: &mut HeaderMap, values: RateLimitHeaders) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(values.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(values.remaining));
    // Reported in unix seconds
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(values.reset_at.div_ceil(1000)),
    );
}

/// Proxy headers first, then the peer address.
pub fn client_identifier(request: &Request) -> ClientId {
    let headers = request.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let id = forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    ClientId(id)
}

/// General limiter in front of every API route.
///
/// Tags the request with its [`ClientId`] for handlers further down.
pub async fn api_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let client = client_identifier(&request);
    let decision = limiter.acquire(&client.0)?;

    debug!(
        client = %client.0,
        path = %request.uri().path(),
        remaining = decision.remaining,
        "API rate limit check passed"
    );

    request.extensions_mut().insert(client);
    let mut response = next.run(request).await;

    // Endpoint-specific limits take precedence
    if !response.headers().contains_key(X_RATELIMIT_LIMIT) {
        insert_rate_limit_headers(response.headers_mut(), (&decision).into());
    }

    Ok(response)
}

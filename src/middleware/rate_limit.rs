use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::handlers::error_body;
use crate::limiter::{RateLimitDecision, RateLimiter};

pub const RATE_LIMITED_CODE: &str = "RATE_LIMIT_EXCEEDED";

/// Client identity used as the limiter key: the first `X-Forwarded-For`
/// hop, then `X-Real-IP`, then the socket peer.
pub fn client_key(req: &Request) -> String {
    let headers = req.headers();
    forwarded_for(headers)
        .or_else(|| header_str(headers, "x-real-ip").map(str::to_owned))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Fixed-window limiting for the routes it wraps.
///
/// Install with `axum::middleware::from_fn_with_state(limiter, rate_limit)`.
/// Denied requests get a 429 and never reach the handler.
pub async fn rate_limit(State(limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    let key = client_key(&req);
    let decision = limiter.check(&key).await;

    if !decision.allowed {
        let config = limiter.config();
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            error_body(RATE_LIMITED_CODE, &config.message),
        )
            .into_response();
        let retry_after = reset_secs(&decision, &limiter);
        insert_headers(response.headers_mut(), &decision, retry_after);
        if let Ok(val) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("Retry-After", val);
        }
        return response;
    }

    let mut response = next.run(req).await;
    insert_headers(response.headers_mut(), &decision, reset_secs(&decision, &limiter));

    if limiter.config().skip_successful_requests && response.status().as_u16() < 400 {
        limiter.decrement(&key).await;
    }
    response
}

/// Whole seconds until the window resets, rounded up.
fn reset_secs(decision: &RateLimitDecision, limiter: &RateLimiter) -> u64 {
    let ms = (decision.reset_at - limiter.now()).num_milliseconds().max(0) as u64;
    ms.div_ceil(1000)
}

fn insert_headers(headers: &mut HeaderMap, decision: &RateLimitDecision, reset: u64) {
    for (name, value) in [
        ("RateLimit-Limit", decision.limit),
        ("RateLimit-Remaining", decision.remaining),
        ("RateLimit-Reset", reset),
    ] {
        if let Ok(val) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name, val);
        }
    }
}

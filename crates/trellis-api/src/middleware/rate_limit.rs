//! # Per-Client Rate Limiting
//!
//! Fixed-window counter keyed by client IP address. Requests that arrive
//! without connection info (tests, some proxies) share the `anonymous`
//! bucket. State is in-memory and per process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use trellis_core::RateLimitSettings;

use crate::error::AppError;

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Buckets kept before expired windows are swept.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
struct BucketState {
    count: u64,
    window_start: Instant,
}

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

/// Shared rate limiter state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 30 requests a minute, for the `rate-limit-strict` route middleware.
    pub fn strict() -> Self {
        Self::new(RateLimitSettings {
            max_requests: 30,
            window: Duration::from_secs(60),
        })
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        let window = self.settings.window;
        let limit = self.settings.max_requests;
        let mut buckets = self.buckets.lock();

        if buckets.len() >= SWEEP_THRESHOLD {
            buckets.retain(|_, b| now.duration_since(b.window_start) < window);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(BucketState {
            count: 0,
            window_start: now,
        });
        if now.duration_since(bucket.window_start) >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        let allowed = bucket.count < limit;
        if allowed {
            bucket.count += 1;
        }
        Decision {
            allowed,
            limit,
            remaining: limit.saturating_sub(bucket.count),
            reset_after: window.saturating_sub(now.duration_since(bucket.window_start)),
        }
    }
}

fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

fn set_headers(headers: &mut HeaderMap, decision: &Decision) {
    let reset = decision.reset_after.as_secs().max(1);
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset));
    if !decision.allowed {
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(reset));
    }
}

/// Middleware that enforces the per-client limit. Rejected requests never
/// reach the layers below.
pub async fn rate_limit(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    let decision = limiter.check(&client_key(&request));

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        AppError::TooManyRequests("Too many requests, please try again later.".to_string()).into_response()
    };
    set_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            max_requests,
            window: Duration::from_secs(60),
        })
    }

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = limiter(2);
        let now = Instant::now();
        assert!(limiter.check_at("a", now).allowed);
        let second = limiter.check_at("a", now);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        assert!(!limiter.check_at("a", now).allowed);
        // Other clients have their own bucket.
        assert!(limiter.check_at("b", now).allowed);
    }

    #[test]
    fn window_resets() {
        let limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.check_at("a", now).allowed);
        assert!(!limiter.check_at("a", now + Duration::from_secs(30)).allowed);
        assert!(limiter.check_at("a", now + Duration::from_secs(60)).allowed);
    }

    #[test]
    fn rejection_sets_retry_after() {
        let limiter = limiter(0);
        let decision = limiter.check("a");
        assert!(!decision.allowed);
        let mut headers = HeaderMap::new();
        set_headers(&mut headers, &decision);
        assert_eq!(headers[LIMIT_HEADER], "0");
        assert!(headers.contains_key(axum::http::header::RETRY_AFTER));
    }
}

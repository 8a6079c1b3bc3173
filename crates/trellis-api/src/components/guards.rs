//! Per-route middleware available to descriptors.

use axum::http::StatusCode;

use crate::catalog::{HandlerResult, RouteNext};
use crate::context::{ParsedBody, RequestContext};
use crate::error::AppError;
use crate::middleware::rate_limit::RateLimiter;

/// Rejects form and raw bodies with 415. An empty body passes; handlers
/// that need one report it themselves.
pub async fn require_json(ctx: RequestContext, next: RouteNext) -> HandlerResult {
    if matches!(ctx.body(), ParsedBody::Form(_) | ParsedBody::Raw { .. }) {
        return Err(AppError::status(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        ));
    }
    next.run(ctx).await
}

pub async fn require_database(ctx: RequestContext, next: RouteNext) -> HandlerResult {
    ctx.database()?;
    next.run(ctx).await
}

pub async fn require_cache(ctx: RequestContext, next: RouteNext) -> HandlerResult {
    ctx.cache()?;
    next.run(ctx).await
}

pub async fn require_storage(ctx: RequestContext, next: RouteNext) -> HandlerResult {
    ctx.storage()?;
    next.run(ctx).await
}

/// A second, tighter limit on top of the global one. Each client gets its
/// own budget per route.
pub async fn rate_limit_strict(ctx: RequestContext, next: RouteNext, limiter: RateLimiter) -> HandlerResult {
    let client = ctx
        .client_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "anonymous".to_string());
    if !limiter.check(&format!("{client} {}", ctx.route())).allowed {
        return Err(AppError::TooManyRequests(
            "Too many API requests, please try again later.".to_string(),
        ));
    }
    next.run(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RouteHandler, RouteMiddleware};
    use crate::envelope::Reply;
    use axum::body::Bytes;
    use axum::http::Method;
    use std::sync::Arc;

    async fn reached(_ctx: RequestContext) -> HandlerResult {
        Ok(Reply::text("reached"))
    }

    fn next() -> RouteNext {
        let handler: Arc<dyn RouteHandler> = Arc::new(reached);
        let chain: Arc<[Arc<dyn RouteMiddleware>]> = Arc::from(Vec::new());
        RouteNext::new(chain, handler)
    }

    #[tokio::test]
    async fn json_guard() {
        let ctx = RequestContext::new(Method::POST, "/").with_body(ParsedBody::Json(serde_json::json!({})));
        assert!(require_json(ctx, next()).await.is_ok());

        let ctx = RequestContext::new(Method::POST, "/").with_body(ParsedBody::Raw {
            content_type: Some("text/plain".into()),
            bytes: Bytes::from_static(b"hi"),
        });
        let err = require_json(ctx, next()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn service_guards_short_circuit_when_disabled() {
        for result in [
            require_database(RequestContext::new(Method::GET, "/"), next()).await,
            require_cache(RequestContext::new(Method::GET, "/"), next()).await,
            require_storage(RequestContext::new(Method::GET, "/"), next()).await,
        ] {
            assert_eq!(result.unwrap_err().status_code(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[tokio::test]
    async fn strict_limit_is_per_client_and_route() {
        let limiter = RateLimiter::strict();
        let alice: std::net::IpAddr = [10, 0, 0, 1].into();
        let bob: std::net::IpAddr = [10, 0, 0, 2].into();
        let ctx = |ip, path: &str| RequestContext::new(Method::POST, path).with_client(ip);

        for _ in 0..30 {
            assert!(rate_limit_strict(ctx(alice, "/users"), next(), limiter.clone()).await.is_ok());
        }
        let err = rate_limit_strict(ctx(alice, "/users"), next(), limiter.clone())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);

        assert!(rate_limit_strict(ctx(bob, "/users"), next(), limiter.clone()).await.is_ok());
        assert!(rate_limit_strict(ctx(alice, "/echo"), next(), limiter).await.is_ok());
    }
}

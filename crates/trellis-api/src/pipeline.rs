//! # Pipeline Composition
//!
//! Wraps the routing table in the fixed middleware chain. Each layer wraps
//! everything listed after it:
//!
//! 1. response normalizer (request id, timing, envelopes, logging)
//! 2. panic catcher (reports panics to the normalizer as 500s)
//! 3. security headers
//! 4. CORS
//! 5. compression (gzip/deflate, bodies above 2 KiB)
//! 6. body parsing
//! 7. rate limiting
//! 8. service injection
//! 9. API docs (outside production), `/metrics` (when enabled), routes
//!
//! Unmatched paths fall through to a 404 rendered by the normalizer.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::predicate::{DefaultPredicate, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use trellis_core::{AppConfig, RunMode};
use trellis_services::ServiceRegistry;

use crate::docs;
use crate::error::AppError;
use crate::loader::RoutingTable;
use crate::middleware::body::{parse_body, BodyLimit};
use crate::middleware::normalizer::{normalize, panic_response, ErrorChannel, NormalizerState};
use crate::middleware::rate_limit::{rate_limit, RateLimiter};
use crate::middleware::security_headers::security_headers;
use crate::middleware::services::inject_services;

/// Responses smaller than this are sent uncompressed.
pub const COMPRESSION_MIN_BYTES: u16 = 2048;

pub const METRICS_PATH: &str = "/metrics";

/// Builder for the HTTP application.
#[derive(Debug, Clone)]
pub struct Pipeline {
    mode: RunMode,
    slow_request: Duration,
    body_limit: usize,
    limiter: RateLimiter,
    registry: Arc<ServiceRegistry>,
    errors: ErrorChannel,
    metrics: Option<PrometheusHandle>,
}

impl Pipeline {
    pub fn new(config: &AppConfig, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            mode: config.mode,
            slow_request: config.slow_request,
            body_limit: config.body_limit_bytes,
            limiter: RateLimiter::new(config.rate_limit),
            registry,
            errors: ErrorChannel::default(),
            metrics: None,
        }
    }

    /// Publishes server errors on `errors` instead of a private channel.
    pub fn with_errors(mut self, errors: ErrorChannel) -> Self {
        self.errors = errors;
        self
    }

    /// Mounts `GET /metrics` rendering `handle`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// The complete application.
    pub fn build(&self, table: RoutingTable) -> Router {
        let docs = (!self.mode.is_production()).then(|| docs::openapi(&table));
        let mut router = table.into_router();

        if let Some(doc) = docs {
            router = router.merge(docs::router(&doc));
        }
        if let Some(handle) = self.metrics.clone() {
            router = router.route(
                METRICS_PATH,
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
            .fallback(not_found)
            .layer(from_fn_with_state(self.registry.clone(), inject_services))
            .layer(from_fn_with_state(self.limiter.clone(), rate_limit))
            .layer(from_fn_with_state(BodyLimit(self.body_limit), parse_body))
            .layer(
                CompressionLayer::new()
                    .compress_when(DefaultPredicate::new().and(SizeAbove::new(COMPRESSION_MIN_BYTES))),
            )
            .layer(cors())
            .layer(from_fn(security_headers))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(from_fn_with_state(
                NormalizerState::new(self.mode, self.slow_request, self.errors.clone()),
                normalize,
            ))
    }
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::DATE,
            HeaderName::from_static("x-request-id"),
        ])
        .max_age(Duration::from_secs(86_400))
}

async fn not_found() -> AppError {
    AppError::NotFound("Not Found".to_string())
}

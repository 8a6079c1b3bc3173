//! # Response Normalizer
//!
//! The outermost layer. It is the only place that:
//!
//! - assigns the request id and sets `X-Request-Id`
//! - measures the request and sets `X-Response-Time`
//! - turns a [`Failure`] (or a bare error status) into an [`ErrorEnvelope`]
//! - logs the request line and records request metrics
//! - publishes server errors on the [`ErrorChannel`]
//!
//! In production the message of a 500 is replaced with
//! `Internal Server Error`. Outside production, 5xx envelopes carry the
//! error chain as `stack`.

use std::any::Any;
use std::time::{Duration, Instant};

use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use trellis_core::{Logger, RunMode};

use crate::context::RequestId;
use crate::envelope::{sniff_content_type, ErrorEnvelope};
use crate::error::{AppError, Failure};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const RESPONSE_TIME_HEADER: HeaderName = HeaderName::from_static("x-response-time");

const LOG: Logger = Logger::new("middleware:response");

/// Capacity of the error channel; slow subscribers miss the oldest reports.
pub const ERROR_CHANNEL_CAPACITY: usize = 256;

/// A server error as published on the [`ErrorChannel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub status: u16,
    pub method: String,
    pub path: String,
    pub request_id: String,
    pub message: String,
    pub chain: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Fan-out of server errors to any number of listeners.
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    sender: broadcast::Sender<ErrorReport>,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new(ERROR_CHANNEL_CAPACITY)
    }
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ErrorReport> {
        self.sender.subscribe()
    }

    /// Returns the number of listeners that received the report.
    pub fn publish(&self, report: ErrorReport) -> usize {
        self.sender.send(report).unwrap_or(0)
    }
}

/// State of the normalizer layer.
#[derive(Debug, Clone)]
pub struct NormalizerState {
    mode: RunMode,
    slow_request: Duration,
    errors: ErrorChannel,
}

impl NormalizerState {
    pub fn new(mode: RunMode, slow_request: Duration, errors: ErrorChannel) -> Self {
        Self {
            mode,
            slow_request,
            errors,
        }
    }

    fn envelope(&self, failure: &Failure) -> ErrorEnvelope {
        let production = self.mode.is_production();
        let message = if production && failure.status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal Server Error".to_string()
        } else {
            failure.message.clone()
        };
        let stack = (!production && failure.status.is_server_error()).then(|| failure.chain.clone());
        ErrorEnvelope {
            message,
            details: failure.details.clone(),
            stack,
        }
    }

    /// Renders failures and types untyped bodies. Returns the failure, if
    /// any, for logging and publication.
    async fn render(&self, response: Response) -> (Response, Option<Failure>) {
        let (mut parts, body) = response.into_parts();
        let empty = body.size_hint().exact() == Some(0);

        let failure = match parts.extensions.remove::<Failure>() {
            Some(failure) => Some(failure),
            None if is_error(parts.status) && empty => Some(Failure::from_status(parts.status)),
            None => None,
        };

        if let Some(failure) = failure {
            return (self.failure_response(parts, &failure), Some(failure));
        }

        if empty || parts.headers.contains_key(header::CONTENT_TYPE) {
            return (Response::from_parts(parts, body), None);
        }

        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                parts.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(sniff_content_type(&bytes)),
                );
                (Response::from_parts(parts, Body::from(bytes)), None)
            }
            Err(err) => {
                let failure = AppError::internal(format!("failed to read response body: {err}")).into_failure();
                parts.status = failure.status;
                (self.failure_response(parts, &failure), Some(failure))
            }
        }
    }

    fn failure_response(&self, mut parts: axum::http::response::Parts, failure: &Failure) -> Response {
        let envelope = self.envelope(failure);
        let bytes = serde_json::to_vec(&envelope).unwrap_or_else(|_| br#"{"message":"Internal Server Error"}"#.to_vec());
        parts.status = failure.status;
        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove(header::CONTENT_ENCODING);
        parts
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Response::from_parts(parts, Body::from(bytes))
    }

    async fn log(&self, line: &RequestLine<'_>, failure: Option<&Failure>) {
        let RequestLine {
            method,
            path,
            status,
            elapsed,
            request_id,
        } = *line;
        let ms = elapsed.as_millis() as u64;
        let status = status.as_u16();
        let message = failure.map(|f| f.message.as_str()).unwrap_or_default();

        if status >= 500 {
            tracing::error!(
                namespace = LOG.namespace(),
                %method, path, status, duration_ms = ms, request_id,
                error = message,
                chain = ?failure.map(|f| &f.chain),
                "{method} {path} {status} {ms}ms - {message}"
            );
        } else if status >= 400 {
            tracing::warn!(
                namespace = LOG.namespace(),
                %method, path, status, duration_ms = ms, request_id,
                error = message,
                "{method} {path} {status} {ms}ms - {message}"
            );
        } else if elapsed >= self.slow_request {
            let memory = process_memory().await;
            tracing::warn!(
                namespace = LOG.namespace(),
                %method, path, status, duration_ms = ms, request_id,
                rss = memory.rss.as_deref().unwrap_or("unknown"),
                peak_rss = memory.peak_rss.as_deref().unwrap_or("unknown"),
                "slow request: {method} {path} {status} {ms}ms"
            );
        } else {
            tracing::info!(
                namespace = LOG.namespace(),
                %method, path, status, duration_ms = ms, request_id,
                "{method} {path} {status} {ms}ms"
            );
        }

        metrics::counter!(
            "http_requests_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        metrics::histogram!("http_request_duration_seconds", "method" => method.to_string())
            .record(elapsed.as_secs_f64());
    }
}

#[derive(Clone, Copy)]
struct RequestLine<'a> {
    method: &'a Method,
    path: &'a str,
    status: StatusCode,
    elapsed: Duration,
    request_id: &'a str,
}

fn is_error(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}

/// Reuses a caller-supplied request id when it is short printable ASCII.
fn incoming_request_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty() && id.len() <= 128 && id.bytes().all(|b| b.is_ascii_graphic()))
        .map(str::to_string)
}

/// The normalizer middleware.
pub async fn normalize(State(state): State<NormalizerState>, mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let request_id = incoming_request_id(&request).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let (mut response, failure) = state.render(response).await;

    let elapsed = started.elapsed();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
        headers.insert(RESPONSE_TIME_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    let line = RequestLine {
        method: &method,
        path: &path,
        status: response.status(),
        elapsed,
        request_id: &request_id,
    };
    state.log(&line, failure.as_ref()).await;

    if let Some(failure) = failure.filter(|f| f.status.is_server_error()) {
        state.errors.publish(ErrorReport {
            status: failure.status.as_u16(),
            method: method.to_string(),
            path,
            request_id,
            message: failure.message,
            chain: failure.chain,
            at: Utc::now(),
        });
    }

    response
}

/// Response for a panic caught below the normalizer. The normalizer
/// renders it like any other internal error.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    AppError::internal(format!("handler panicked: {detail}")).into_response()
}

#[derive(Debug, Default)]
struct ProcessMemory {
    rss: Option<String>,
    peak_rss: Option<String>,
}

/// Resident set size from `/proc/self/status`; unknown off Linux.
async fn process_memory() -> ProcessMemory {
    let Ok(status) = tokio::fs::read_to_string("/proc/self/status").await else {
        return ProcessMemory::default();
    };
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(|value| value.trim().to_string())
    };
    ProcessMemory {
        rss: field("VmRSS:"),
        peak_rss: field("VmHWM:"),
    }
}

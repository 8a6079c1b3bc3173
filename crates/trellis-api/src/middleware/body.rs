//! # Request Body Parsing
//!
//! Buffers the request body up to the configured limit and decodes JSON
//! and URL-encoded forms into a [`ParsedBody`] request extension. Other
//! content types are kept as raw bytes. The buffered bytes are put back on
//! the request, so inner layers can still read the body themselves.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::context::ParsedBody;
use crate::error::AppError;

/// Largest accepted request body, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimit(pub usize);

fn too_large(limit: usize) -> AppError {
    AppError::PayloadTooLarge(format!("Request body exceeds the {limit} byte limit"))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decodes `bytes` according to the declared content type.
pub fn decode(content_type: Option<&str>, bytes: &[u8]) -> Result<ParsedBody, AppError> {
    if bytes.is_empty() {
        return Ok(ParsedBody::Empty);
    }
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());

    match essence.as_deref() {
        Some(ct) if ct == "application/json" || ct.ends_with("+json") => serde_json::from_slice(bytes)
            .map(ParsedBody::Json)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {e}"))),
        Some("application/x-www-form-urlencoded") => Ok(ParsedBody::Form(
            url::form_urlencoded::parse(bytes).into_owned().collect(),
        )),
        _ => Ok(ParsedBody::Raw {
            content_type: content_type.map(str::to_string),
            bytes: axum::body::Bytes::copy_from_slice(bytes),
        }),
    }
}

pub async fn parse_body(State(BodyLimit(limit)): State<BodyLimit>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    if content_length(&parts.headers).is_some_and(|len| len > limit) {
        return too_large(limit).into_response();
    }

    let bytes = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            return too_large(limit).into_response();
        }
        Err(err) => {
            return AppError::BadRequest(format!("Failed to read request body: {err}")).into_response();
        }
    };

    let parsed = match decode(content_type(&parts.headers).as_deref(), &bytes) {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };
    parts.extensions.insert(parsed);

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

//! # Response Envelopes
//!
//! Success bodies are `{ "data": ... }`; failure bodies are
//! `{ "message", "details"?, "stack"? }`.
//!
//! [`Reply`] is what a route handler returns on success. JSON replies are
//! wrapped in the success envelope where they are produced, so the
//! compression layer sees the final body. Error envelopes are rendered only
//! by the response normalizer.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::FieldError;

/// Success body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    pub data: T,
}

/// Failure body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorEnvelope {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
    /// Error chain, outside production only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
}

/// A handler's successful outcome.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Rendered as `{ "data": value }`.
    Json {
        status: StatusCode,
        data: serde_json::Value,
    },
    /// Raw text. Content type is `application/json` when the text looks
    /// like JSON, `text/plain` otherwise.
    Text { status: StatusCode, body: String },
    /// Raw bytes served as an attachment.
    File {
        filename: String,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    /// Status only, no body.
    Empty(StatusCode),
}

impl Reply {
    pub fn ok<T: Serialize>(data: T) -> Self {
        Self::json(StatusCode::OK, data)
    }

    pub fn created<T: Serialize>(data: T) -> Self {
        Self::json(StatusCode::CREATED, data)
    }

    pub fn no_content() -> Self {
        Self::Empty(StatusCode::NO_CONTENT)
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::Text {
            status: StatusCode::OK,
            body: body.into(),
        }
    }

    pub fn file(filename: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self::File {
            filename: filename.into(),
            content_type,
            bytes,
        }
    }

    /// Serialization of `data` cannot fail for the types handlers return;
    /// if it does, the payload degrades to `null`.
    pub fn json<T: Serialize>(status: StatusCode, data: T) -> Self {
        let data = serde_json::to_value(data).unwrap_or(serde_json::Value::Null);
        Self::Json { status, data }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Json { status, .. } | Self::Text { status, .. } => *status,
            Self::File { .. } => StatusCode::OK,
            Self::Empty(status) => *status,
        }
    }
}

/// `application/json` when the first non-whitespace byte opens an object
/// or array, `text/plain` otherwise.
pub fn sniff_content_type(body: &[u8]) -> &'static str {
    match body.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => "application/json",
        _ => "text/plain; charset=utf-8",
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Self::Json { status, data } => (status, Json(SuccessEnvelope { data })).into_response(),
            Self::Text { status, body } => {
                let content_type = sniff_content_type(body.as_bytes());
                (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
            }
            Self::File {
                filename,
                content_type,
                bytes,
            } => {
                let content_type = content_type
                    .and_then(|ct| HeaderValue::from_str(&ct).ok())
                    .unwrap_or(HeaderValue::from_static("application/octet-stream"));
                let disposition = HeaderValue::from_str(&format!(
                    "attachment; filename=\"{}\"",
                    filename.replace(['"', '\\'], "_")
                ))
                .unwrap_or(HeaderValue::from_static("attachment"));
                let mut response = bytes.into_response();
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_TYPE, content_type);
                headers.insert(header::CONTENT_DISPOSITION, disposition);
                response
            }
            Self::Empty(status) => status.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_reply_is_wrapped_in_data() {
        let response = Reply::created(serde_json::json!({"id": 7})).into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(body_string(response).await, r#"{"data":{"id":7}}"#);
    }

    #[tokio::test]
    async fn text_reply_sniffs_content_type() {
        let plain = Reply::text("hello").into_response();
        assert!(plain.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let json = Reply::text("  [1,2]").into_response();
        assert_eq!(json.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn file_reply_sets_attachment() {
        let response = Reply::file("report.csv", Some("text/csv".into()), b"a,b".to_vec()).into_response();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.csv\""
        );
        assert_eq!(body_string(response).await, "a,b");
    }

    #[test]
    fn error_envelope_omits_empty_fields() {
        let envelope = ErrorEnvelope {
            message: "Not Found".into(),
            details: None,
            stack: None,
        };
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"message":"Not Found"}"#
        );
    }

    #[test]
    fn empty_reply_has_status() {
        assert_eq!(Reply::no_content().status(), StatusCode::NO_CONTENT);
    }
}

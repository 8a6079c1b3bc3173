//! # API Error Types
//!
//! [`AppError`] is what handlers and middleware return on failure. Its
//! `IntoResponse` impl does not render a body: it sets the status and
//! attaches a [`Failure`] record to the response extensions. The response
//! normalizer is the single place that turns a `Failure` into an error
//! envelope, so the production/development decision is made once.

use std::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trellis_services::ServiceError;
use utoipa::ToSchema;

/// Boxed error carried as the cause of an internal failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Application-level error returned by handlers and middleware.
///
/// The `Display` output is the client-facing message.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed input (400).
    #[error("{0}")]
    BadRequest(String),

    /// Resource not found (404).
    #[error("{0}")]
    NotFound(String),

    /// Conflict with current resource state (409).
    #[error("{0}")]
    Conflict(String),

    /// Request body larger than the configured limit (413).
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Field-level validation failure (422).
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<FieldError>,
    },

    /// Rate limit exceeded (429).
    #[error("{0}")]
    TooManyRequests(String),

    /// A required backing service is disabled or degraded (503).
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Any other explicit status.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// Unexpected failure (500). The message is hidden in production.
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
        location: &'static Location<'static>,
    },
}

impl AppError {
    /// An internal error recording the caller's source location.
    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
            location: Location::caller(),
        }
    }

    /// An internal error wrapping `source`, recording the caller's location.
    #[track_caller]
    pub fn internal_from(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::Internal {
            message: source.to_string(),
            source: Some(source),
            location: Location::caller(),
        }
    }

    /// An error with an explicit status code.
    #[track_caller]
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => Self::internal(message),
            status => Self::Status { status, message },
        }
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        let message = match details.first() {
            Some(first) => first.message.clone(),
            None => "Validation failed".to_string(),
        };
        Self::Validation { message, details }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Status { status, .. } => *status,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error message followed by each `source()` in turn, then the
    /// location an internal error was raised at.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![format!("{}: {self}", self.kind())];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(format!("caused by: {err}"));
            source = err.source();
        }
        if let Self::Internal { location, .. } = self {
            chain.push(format!("at {}:{}:{}", location.file(), location.line(), location.column()));
        }
        chain
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::PayloadTooLarge(_) => "PayloadTooLarge",
            Self::Validation { .. } => "Validation",
            Self::TooManyRequests(_) => "TooManyRequests",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::Status { .. } => "Error",
            Self::Internal { .. } => "Internal",
        }
    }

    pub fn into_failure(self) -> Failure {
        let status = self.status_code();
        let chain = self.chain();
        let details = match &self {
            Self::Validation { details, .. } if !details.is_empty() => Some(details.clone()),
            _ => None,
        };
        Failure {
            status,
            message: self.to_string(),
            details,
            chain,
        }
    }
}

/// A failure waiting to be rendered by the response normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
    pub chain: Vec<String>,
}

impl Failure {
    /// A failure for a bare error status produced outside any handler,
    /// such as a method mismatch.
    pub fn from_status(status: StatusCode) -> Self {
        let message = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            status,
            chain: vec![format!("{}: {message}", status.as_u16())],
            message,
            details: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let failure = self.into_failure();
        let mut response = failure.status.into_response();
        response.extensions_mut().insert(failure);
        response
    }
}

/// Database errors: missing rows are 404, unique violations are 409,
/// anything else is internal.
impl From<sqlx::Error> for AppError {
    #[track_caller]
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict("Resource already exists".to_string())
            }
            _ => Self::internal_from(err),
        }
    }
}

/// Service access from a handler: sentinels become 503, a closed handle
/// is internal.
impl From<ServiceError> for AppError {
    #[track_caller]
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotEnabled { capability } => {
                Self::ServiceUnavailable(format!("The {capability} service is not enabled"))
            }
            ServiceError::Unavailable { capability }
            | ServiceError::Connecting { capability } => Self::ServiceUnavailable(format!(
                "The {capability} service is temporarily unavailable"
            )),
            other => Self::internal_from(other),
        }
    }
}

/// Request types that check business rules beyond what deserialization
/// enforces.
pub trait Validate {
    /// Returns every field that failed, or an empty list.
    fn validate(&self) -> Vec<FieldError>;
}

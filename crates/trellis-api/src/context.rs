//! # Request Context
//!
//! The single argument every route handler and route middleware receives.
//! It is built fresh for each request from the parts the outer layers left
//! in the request extensions and is never shared between requests.

use std::collections::HashMap;
use std::net::IpAddr;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use trellis_services::{CacheClient, ServiceClients, StorageClient};

use crate::envelope::Reply;
use crate::error::{AppError, Validate};

/// Request id assigned by the response normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Request body as decoded by the body parsing layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ParsedBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(HashMap<String, String>),
    /// Any other content type, kept as-is.
    Raw {
        content_type: Option<String>,
        bytes: Bytes,
    },
}

impl ParsedBody {
    /// The body as a JSON value. Forms become a flat object of strings.
    pub fn as_value(&self) -> Option<serde_json::Value> {
        match self {
            Self::Json(value) => Some(value.clone()),
            Self::Form(fields) => Some(serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            )),
            Self::Empty | Self::Raw { .. } => None,
        }
    }
}

/// Everything a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub(crate) method: Method,
    pub(crate) path: String,
    /// Method and declared pattern, e.g. `GET /users/:id`.
    pub(crate) route: String,
    pub(crate) client: Option<IpAddr>,
    pub(crate) component: String,
    pub(crate) params: HashMap<String, String>,
    pub(crate) query: HashMap<String, String>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ParsedBody,
    pub(crate) services: ServiceClients,
    pub(crate) request_id: Option<String>,
}

impl RequestContext {
    /// A context with no parameters, body or services; handlers under test
    /// fill in what they need with the `with_*` methods.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            route: format!("{method} {path}"),
            method,
            path,
            client: None,
            component: String::new(),
            params: HashMap::new(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: ParsedBody::Empty,
            services: ServiceClients::disabled(),
            request_id: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_client(mut self, ip: IpAddr) -> Self {
        self.client = Some(ip);
        self
    }

    pub fn with_body(mut self, body: ParsedBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_services(mut self, services: ServiceClients) -> Self {
        self.services = services;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The matched route as `METHOD pattern`; the same for every request
    /// the route serves, whatever its parameters.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Peer address of the connection, when the server recorded one.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client
    }

    /// Directory of the descriptor that declared the matched route.
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// A path parameter parsed into `T`; 400 when absent or malformed.
    pub fn param_as<T: std::str::FromStr>(&self, name: &str) -> Result<T, AppError> {
        self.param(name)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| AppError::BadRequest(format!("Invalid path parameter: {name}")))
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &ParsedBody {
        &self.body
    }

    /// Deserializes the JSON or form body; 400 on a missing or mismatched
    /// body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        let value = self
            .body
            .as_value()
            .ok_or_else(|| AppError::BadRequest("Request body is required".to_string()))?;
        serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("Invalid request body: {e}")))
    }

    /// [`json`](Self::json) followed by [`Validate::validate`]; 422 with
    /// field details when any rule fails.
    pub fn validated_json<T: DeserializeOwned + Validate>(&self) -> Result<T, AppError> {
        let value: T = self.json()?;
        let errors = value.validate();
        if errors.is_empty() {
            Ok(value)
        } else {
            Err(AppError::validation(errors))
        }
    }

    pub fn services(&self) -> &ServiceClients {
        &self.services
    }

    /// The database pool; 503 when the database is disabled or degraded.
    pub fn database(&self) -> Result<PgPool, AppError> {
        Ok(self.services.database()?)
    }

    /// The cache client; 503 when the cache is disabled or degraded.
    pub fn cache(&self) -> Result<CacheClient, AppError> {
        Ok(self.services.cache()?)
    }

    /// The object store client; 503 when storage is disabled or degraded.
    pub fn storage(&self) -> Result<StorageClient, AppError> {
        Ok(self.services.storage()?)
    }

    pub fn success<T: Serialize>(&self, data: T) -> Result<Reply, AppError> {
        Ok(Reply::ok(data))
    }

    pub fn created<T: Serialize>(&self, data: T) -> Result<Reply, AppError> {
        Ok(Reply::created(data))
    }

    pub fn no_content(&self) -> Result<Reply, AppError> {
        Ok(Reply::no_content())
    }

    pub fn text(&self, body: impl Into<String>) -> Result<Reply, AppError> {
        Ok(Reply::text(body))
    }

    pub fn file(
        &self,
        filename: impl Into<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<Reply, AppError> {
        Ok(Reply::file(filename, content_type, bytes))
    }

    /// An error outcome with an explicit status.
    #[track_caller]
    pub fn error(&self, status: StatusCode, message: impl Into<String>) -> Result<Reply, AppError> {
        Err(AppError::status(status, message))
    }
}

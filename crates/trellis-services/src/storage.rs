//! # Object Store Connector
//!
//! S3/MinIO-style object store reached over HTTP with `reqwest`.
//! Objects live at `{endpoint}/{bucket}/{name}` (path-style addressing).
//!
//! With an access key and secret configured, every request is signed with
//! [`RequestSigner`]; without them requests go out anonymously and the
//! bucket must allow that.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use trellis_core::{Capability, StorageSettings};
use url::Url;

use crate::error::{BoxError, ServiceError};
use crate::handle::Connector;
use crate::signing::RequestSigner;

/// Metadata returned after an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub bucket: String,
    pub object_name: String,
    pub size: usize,
    pub content_type: String,
}

/// A downloaded object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// HTTP client bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    bucket_url: Url,
    bucket: String,
    signer: Option<RequestSigner>,
}

impl StorageClient {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BoxError> {
        let mut request = request.build()?;
        if let Some(signer) = &self.signer {
            signer.sign(&mut request, Utc::now())?;
        }
        Ok(self.http.execute(request).await?)
    }

    fn object_url(&self, name: &str) -> Result<Url, ServiceError> {
        let mut url = self.bucket_url.clone();
        url.path_segments_mut()
            .map_err(|_| ServiceError::operation(Capability::Storage, "endpoint cannot hold a path"))?
            .push(name);
        Ok(url)
    }

    /// Uploads `bytes` as `name`, replacing any existing object.
    pub async fn put_object(
        &self,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ObjectInfo, ServiceError> {
        let size = bytes.len();
        let request = self
            .http
            .put(self.object_url(name)?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let resp = self
            .send(request)
            .await
            .map_err(|e| ServiceError::operation(Capability::Storage, e))?;

        if !resp.status().is_success() {
            return Err(status_error("PUT", name, resp.status()));
        }
        tracing::info!(bucket = %self.bucket, object = %name, size, "object uploaded");
        Ok(ObjectInfo {
            bucket: self.bucket.clone(),
            object_name: name.to_string(),
            size,
            content_type: content_type.to_string(),
        })
    }

    /// Downloads `name`; `None` when the object does not exist.
    pub async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, ServiceError> {
        let resp = self
            .send(self.http.get(self.object_url(name)?))
            .await
            .map_err(|e| ServiceError::operation(Capability::Storage, e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error("GET", name, resp.status()));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ServiceError::operation(Capability::Storage, e))?;
        Ok(Some(StoredObject {
            bytes: bytes.to_vec(),
            content_type,
        }))
    }

    /// Deletes `name`. Deleting a missing object succeeds.
    pub async fn remove_object(&self, name: &str) -> Result<(), ServiceError> {
        let resp = self
            .send(self.http.delete(self.object_url(name)?))
            .await
            .map_err(|e| ServiceError::operation(Capability::Storage, e))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::info!(bucket = %self.bucket, object = %name, "object removed");
            return Ok(());
        }
        Err(status_error("DELETE", name, status))
    }

    /// Creates the bucket when a HEAD on it reports it missing.
    async fn ensure_bucket(&self) -> Result<(), BoxError> {
        let head = self.send(self.http.head(self.bucket_url.clone())).await?;
        match head.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                let created = self.send(self.http.put(self.bucket_url.clone())).await?;
                if !created.status().is_success() {
                    return Err(format!("creating bucket {} returned {}", self.bucket, created.status()).into());
                }
                tracing::info!(bucket = %self.bucket, "bucket created");
                Ok(())
            }
            other => Err(format!("checking bucket {} returned {other}", self.bucket).into()),
        }
    }
}

fn status_error(method: &str, name: &str, status: StatusCode) -> ServiceError {
    ServiceError::Operation {
        capability: Capability::Storage,
        message: format!("{method} {name} returned {status}"),
    }
}

/// Builds a [`StorageClient`] from [`StorageSettings`].
#[derive(Debug, Clone)]
pub struct StorageConnector {
    bucket_url: Url,
    bucket: String,
    signer: Option<RequestSigner>,
}

impl StorageConnector {
    /// Fails when the endpoint is not an absolute URL.
    pub fn new(settings: &StorageSettings) -> Result<Self, url::ParseError> {
        let mut bucket_url = Url::parse(&settings.endpoint)?;
        if bucket_url.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
        }
        if let Ok(mut segments) = bucket_url.path_segments_mut() {
            segments.pop_if_empty().push(&settings.bucket);
        }
        Ok(Self {
            bucket_url,
            bucket: settings.bucket.clone(),
            signer: RequestSigner::from_settings(settings),
        })
    }

    pub fn bucket_url(&self) -> &Url {
        &self.bucket_url
    }
}

#[async_trait]
impl Connector for StorageConnector {
    type Client = StorageClient;

    fn capability(&self) -> Capability {
        Capability::Storage
    }

    async fn connect(&self) -> Result<StorageClient, BoxError> {
        let client = StorageClient {
            http: reqwest::Client::builder().build()?,
            bucket_url: self.bucket_url.clone(),
            bucket: self.bucket.clone(),
            signer: self.signer.clone(),
        };
        client.ensure_bucket().await?;
        Ok(client)
    }

    async fn ping(&self, client: &StorageClient) -> Result<(), BoxError> {
        let resp = client.send(client.http.head(client.bucket_url.clone())).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("bucket check returned {}", resp.status()).into())
        }
    }

    async fn disconnect(&self, _client: StorageClient) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;
    use axum::http::HeaderMap;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn settings(endpoint: &str) -> StorageSettings {
        StorageSettings {
            endpoint: endpoint.to_string(),
            bucket: "uploads".to_string(),
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
        }
    }

    #[test]
    fn bucket_url_appends_bucket() {
        let c = StorageConnector::new(&settings("http://minio:9000")).unwrap();
        assert_eq!(c.bucket_url().as_str(), "http://minio:9000/uploads");

        let c = StorageConnector::new(&settings("http://minio:9000/base/")).unwrap();
        assert_eq!(c.bucket_url().as_str(), "http://minio:9000/base/uploads");
    }

    #[test]
    fn relative_endpoint_is_rejected() {
        assert!(StorageConnector::new(&settings("minio:9000")).is_err());
        assert!(StorageConnector::new(&settings("not a url")).is_err());
    }

    #[test]
    fn object_names_are_escaped() {
        let c = StorageConnector::new(&settings("http://minio:9000")).unwrap();
        let client = StorageClient {
            http: reqwest::Client::new(),
            bucket_url: c.bucket_url().clone(),
            bucket: "uploads".to_string(),
            signer: None,
        };
        let url = client.object_url("report 2024.pdf").unwrap();
        assert_eq!(url.as_str(), "http://minio:9000/uploads/report%202024.pdf");
    }

    /// Serves 200 to everything and records each request's
    /// `Authorization` header.
    async fn recording_store() -> (String, Arc<Mutex<Vec<Option<String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let app = axum::Router::new().fallback(move |headers: HeaderMap| {
            let log = log.clone();
            async move {
                log.lock().push(
                    headers
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                );
                StatusCode::OK
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn configured_keys_sign_every_request() {
        let (endpoint, seen) = recording_store().await;
        let mut config = settings(&endpoint);
        config.access_key = Some("ak".to_string());
        config.secret_key = Some("sk".to_string());
        let connector = StorageConnector::new(&config).unwrap();

        let client = connector.connect().await.unwrap();
        client.put_object("a.txt", b"hi".to_vec(), "text/plain").await.unwrap();
        client.remove_object("a.txt").await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        for auth in seen.iter() {
            let auth = auth.as_deref().unwrap_or_default();
            assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=ak/"), "{auth}");
        }
    }

    #[tokio::test]
    async fn without_keys_requests_are_anonymous() {
        let (endpoint, seen) = recording_store().await;
        let connector = StorageConnector::new(&settings(&endpoint)).unwrap();

        let client = connector.connect().await.unwrap();
        client.put_object("a.txt", b"hi".to_vec(), "text/plain").await.unwrap();

        assert_eq!(*seen.lock(), vec![None, None]);
    }
}

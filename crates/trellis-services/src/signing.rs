//! # Request Signing
//!
//! AWS Signature Version 4 for the object store, using a static key pair.
//! S3 and MinIO both accept it; MinIO ignores the region unless one is
//! configured on the server.
//!
//! Every header present on the request when it is signed is covered by the
//! signature, together with `host`. The payload is hashed in full, so only
//! requests with an in-memory body can be signed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use sha2::{Digest, Sha256};
use trellis_core::StorageSettings;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Everything outside `A-Z a-z 0-9 - . _ ~` is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub const AMZ_DATE: &str = "x-amz-date";
pub const AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signing key rejected: {0}")]
    Key(#[from] hmac::digest::InvalidLength),

    #[error("header {0} is not visible ASCII and cannot be signed")]
    HeaderText(String),

    #[error("invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("request URL has no host")]
    NoHost,
}

/// Signs object store requests with one access key.
#[derive(Clone)]
pub struct RequestSigner {
    access_key: String,
    secret_key: String,
    region: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .field("region", &self.region)
            .finish()
    }
}

impl RequestSigner {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }

    /// `None` when the settings carry no key pair.
    pub fn from_settings(settings: &StorageSettings) -> Option<Self> {
        match (&settings.access_key, &settings.secret_key) {
            (Some(access), Some(secret)) => Some(Self::new(access, secret, &settings.region)),
            _ => None,
        }
    }

    /// Adds `x-amz-date`, `x-amz-content-sha256` and `authorization` to
    /// `request`.
    pub fn sign(&self, request: &mut reqwest::Request, at: DateTime<Utc>) -> Result<(), SignError> {
        let payload_hash = {
            let payload = request.body().and_then(|body| body.as_bytes()).unwrap_or_default();
            hex::encode(Sha256::digest(payload))
        };

        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static(AMZ_DATE),
            HeaderValue::from_str(&at.format(AMZ_DATE_FORMAT).to_string())?,
        );
        headers.insert(
            HeaderName::from_static(AMZ_CONTENT_SHA256),
            HeaderValue::from_str(&payload_hash)?,
        );

        let mut signed = Vec::with_capacity(request.headers().len());
        for (name, value) in request.headers() {
            let value = value
                .to_str()
                .map_err(|_| SignError::HeaderText(name.to_string()))?;
            signed.push((name.as_str().to_string(), value.to_string()));
        }

        let authorization = self.authorization(
            request.method().as_str(),
            request.url(),
            &signed,
            &payload_hash,
            at,
        )?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&authorization)?);
        Ok(())
    }

    /// The `Authorization` value for a request carrying `headers` whose
    /// body hashes to `payload_hash`. `host` is taken from `url`.
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
        payload_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<String, SignError> {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(SignError::NoHost),
        };

        let mut canonical: BTreeMap<String, Vec<String>> = BTreeMap::new();
        canonical.entry("host".to_string()).or_default().push(host);
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name != "host" {
                canonical.entry(name).or_default().push(collapse_whitespace(value));
            }
        }
        let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");
        let header_block: String = canonical
            .iter()
            .map(|(name, values)| format!("{name}:{}\n", values.join(",")))
            .collect();

        let canonical_request = format!(
            "{method}\n{}\n{}\n{header_block}\n{signed_headers}\n{payload_hash}",
            canonical_uri(url),
            canonical_query(url),
        );

        let date = at.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            at.format(AMZ_DATE_FORMAT),
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let signature = hex::encode(hmac(&self.signing_key(&date)?, string_to_sign.as_bytes())?);
        Ok(format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        ))
    }

    fn signing_key(&self, date: &str) -> Result<Vec<u8>, SignError> {
        let key = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let key = hmac(&key, self.region.as_bytes())?;
        let key = hmac(&key, SERVICE.as_bytes())?;
        hmac(&key, b"aws4_request")
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn encode(raw: &str) -> String {
    utf8_percent_encode(raw, UNRESERVED).to_string()
}

/// The path with each segment decoded, then re-encoded strictly.
fn canonical_uri(url: &Url) -> String {
    match url.path() {
        "" => "/".to_string(),
        path => path
            .split('/')
            .map(|segment| encode(&percent_decode_str(segment).decode_utf8_lossy()))
            .collect::<Vec<_>>()
            .join("/"),
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| (encode(&name), encode(&value)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

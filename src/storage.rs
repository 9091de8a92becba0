//! Object storage for punch photos.
//!
//! [`S3ObjectSink`] uploads with a SigV4-signed `PUT` using only the `hmac`
//! and `sha2` crates, then hands back either the public object URL or a
//! presigned `GET` URL. Objects are keyed
//! `{prefix}{YYYYmmdd}/{ident}_{HHMMSS}_{uuid8}.jpg` from the punch time.
//!
//! Credentials are read from the environment on every upload:
//!
//! ```bash
//! export AWS_ACCESS_KEY_ID=AKIA...
//! export AWS_SECRET_ACCESS_KEY=...
//! export AWS_SESSION_TOKEN=...  # optional, for temporary credentials
//! ```
//!
//! With `endpoint_url` set (MinIO, LocalStack) requests use path-style
//! addressing against that endpoint.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// Longest validity SigV4 allows for a presigned URL.
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;

#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Store a punch photo and return the URL recorded on the punch row.
    async fn upload_punch_image(&self, ident: &str, punch_time: &str, image: &[u8])
        -> Result<String>;
}

pub struct DisabledObjectSink;

#[async_trait]
impl ObjectSink for DisabledObjectSink {
    async fn upload_punch_image(
        &self,
        _ident: &str,
        _punch_time: &str,
        _image: &[u8],
    ) -> Result<String> {
        bail!("Object storage is disabled (set storage.provider)")
    }
}

/// Build the object key for a punch photo.
pub fn punch_object_key(prefix: &str, ident: &str, punch_time: &str, unique: &str) -> String {
    let at = DateTime::parse_from_rfc3339(punch_time)
        .map(|dt| dt.naive_local())
        .unwrap_or_else(|_| Utc::now().naive_utc());
    format!(
        "{}{}/{}_{}_{}.jpg",
        prefix,
        at.format("%Y%m%d"),
        ident,
        at.format("%H%M%S"),
        unique
    )
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ S3 ============

/// Where objects live: `{base_url}{path_prefix}/{key}`.
#[derive(Debug, Clone, PartialEq)]
struct S3Location {
    base_url: String,
    host: String,
    /// `""` for virtual-hosted buckets, `"/{bucket}"` for path-style.
    path_prefix: String,
    region: String,
}

impl S3Location {
    fn from_config(config: &StorageConfig) -> Self {
        match config.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                let endpoint = endpoint.trim_end_matches('/');
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                Self {
                    base_url: endpoint.to_string(),
                    host,
                    path_prefix: format!("/{}", uri_encode(&config.bucket)),
                    region: config.region.clone(),
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
                Self {
                    base_url: format!("https://{}", host),
                    host,
                    path_prefix: String::new(),
                    region: config.region.clone(),
                }
            }
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("{}/{}", self.path_prefix, encoded_key)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}{}", self.base_url, self.canonical_uri(key))
    }
}

pub struct S3ObjectSink {
    client: reqwest::Client,
    location: S3Location,
    bucket: String,
    prefix: String,
    public_urls: bool,
    expiry_secs: u64,
}

impl S3ObjectSink {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            bail!("storage.bucket required for s3 provider");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            location: S3Location::from_config(config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            public_urls: config.public_urls,
            expiry_secs: config
                .signed_url_expiry_hours
                .saturating_mul(3600)
                .clamp(1, MAX_PRESIGN_SECS),
        })
    }

    async fn put_object(&self, creds: &AwsCredentials, key: &str, body: &[u8]) -> Result<()> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body);

        let mut headers = vec![
            ("host".to_string(), self.location.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            self.location.canonical_uri(key),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.location.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            &self.location.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut req_builder = self
            .client
            .put(self.location.object_url(key))
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .header("Content-Type", "image/jpeg")
            .body(body.to_vec());

        if let Some(ref token) = creds.session_token {
            req_builder = req_builder.header("x-amz-security-token", token);
        }

        let resp = req_builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to put s3://{}/{}: {}", self.bucket, key, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, key, text);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectSink for S3ObjectSink {
    async fn upload_punch_image(
        &self,
        ident: &str,
        punch_time: &str,
        image: &[u8],
    ) -> Result<String> {
        let creds = AwsCredentials::from_env()?;
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let key = punch_object_key(&self.prefix, ident, punch_time, &unique[..8]);

        self.put_object(&creds, &key, image).await?;
        debug!(bucket = %self.bucket, %key, bytes = image.len(), "uploaded punch image");

        if self.public_urls {
            Ok(self.location.object_url(&key))
        } else {
            Ok(presign_get(
                &self.location,
                &key,
                &creds,
                Utc::now(),
                self.expiry_secs,
            ))
        }
    }
}

/// Build a SigV4 query-string presigned `GET` URL.
fn presign_get(
    location: &S3Location,
    key: &str,
    creds: &AwsCredentials,
    now: DateTime<Utc>,
    expires_secs: u64,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, location.region);

    let mut params = vec![
        ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential".to_string(),
            format!("{}/{}", creds.access_key_id, credential_scope),
        ),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), expires_secs.to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];
    if let Some(ref token) = creds.session_token {
        params.push(("X-Amz-Security-Token".to_string(), token.clone()));
    }
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_uri = location.canonical_uri(key);
    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
        canonical_uri, canonical_query, location.host
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );
    let signing_key =
        derive_signing_key(&creds.secret_access_key, &date_stamp, &location.region, "s3");
    let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

    format!(
        "{}{}?{}&X-Amz-Signature={}",
        location.base_url, canonical_uri, canonical_query, signature
    )
}

/// Instantiate the sink named by `storage.provider`.
pub fn create_object_sink(config: &StorageConfig) -> Result<Box<dyn ObjectSink>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledObjectSink)),
        "s3" => Ok(Box::new(S3ObjectSink::new(config)?)),
        other => bail!("Unknown storage provider: {}", other),
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never takes the error branch.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

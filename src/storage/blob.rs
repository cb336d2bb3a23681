//! S3-compatible blob store for non-indicator-bearing file bodies
//!
//! Talks to MinIO (or any S3-compatible endpoint) over its REST API with
//! AWS Signature V4 auth, using path-style addressing so custom endpoints
//! work directly. Pure-Rust signing (`hmac` + `sha2`), no vendor SDK.
//!
//! Objects are keyed by `file_id`; overwrite wins.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::BlobConfig;
use crate::storage::Dependency;

type HmacSha256 = Hmac<Sha256>;

/// MinIO's implicit default region.
const REGION: &str = "us-east-1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub key: String,
    pub size: u64,
}

/// A retrieved object: metadata plus a streaming body.
pub struct BlobObject {
    pub size: u64,
    pub content_type: String,
    response: reqwest::Response,
}

impl BlobObject {
    /// Consume the object, yielding its body as a byte stream.
    pub fn into_stream(
        self,
    ) -> impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> {
        self.response.bytes_stream()
    }
}

/// Handle over the object store. Clone-cheap; the HTTP client pools
/// connections internally.
#[derive(Clone)]
pub struct BlobStore {
    client: reqwest::Client,
    endpoint: String,
    scheme: &'static str,
    bucket: String,
    access_key: String,
    secret_key: String,
}

impl BlobStore {
    /// Connect and ensure the bucket exists, creating it if absent.
    pub async fn connect(cfg: &BlobConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let store = Self {
            client,
            endpoint: cfg.endpoint.clone(),
            scheme: if cfg.use_ssl { "https" } else { "http" },
            bucket: cfg.bucket.clone(),
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
        };

        store.ensure_bucket().await?;
        tracing::info!(endpoint = %cfg.endpoint, bucket = %cfg.bucket, "connected to blob store");
        Ok(store)
    }

    /// Upload bytes under the given key. Overwrite wins.
    pub async fn put(&self, key: &str, content: &[u8], content_type: &str) -> Result<UploadInfo> {
        let uri = self.object_uri(key);
        let payload_hash = hex_sha256(content);

        let resp = self
            .request(reqwest::Method::PUT, &uri, &payload_hash)
            .header("Content-Type", content_type)
            .body(content.to_vec())
            .send()
            .await
            .with_context(|| format!("failed to upload blob '{key}'"))?;

        if !resp.status().is_success() {
            bail!("blob PUT failed (HTTP {}) for key '{}'", resp.status(), key);
        }

        tracing::debug!(key, size = content.len(), "uploaded blob");
        Ok(UploadInfo {
            key: key.to_string(),
            size: content.len() as u64,
        })
    }

    /// Fetch an object for streaming. `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<BlobObject>> {
        let uri = self.object_uri(key);
        let payload_hash = hex_sha256(b"");

        let resp = self
            .request(reqwest::Method::GET, &uri, &payload_hash)
            .send()
            .await
            .with_context(|| format!("failed to get blob '{key}'"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("blob GET failed (HTTP {}) for key '{}'", resp.status(), key);
        }

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(Some(BlobObject {
            size,
            content_type,
            response: resp,
        }))
    }

    /// Whether an object exists under the key.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let uri = self.object_uri(key);
        let payload_hash = hex_sha256(b"");

        let resp = self
            .request(reqwest::Method::HEAD, &uri, &payload_hash)
            .send()
            .await
            .with_context(|| format!("failed to stat blob '{key}'"))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => bail!("blob HEAD failed (HTTP {}) for key '{}'", s, key),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let uri = format!("/{}", self.bucket);
        let payload_hash = hex_sha256(b"");
        let resp = self
            .request(reqwest::Method::HEAD, &uri, &payload_hash)
            .send()
            .await
            .context("blob store unreachable")?;
        if !resp.status().is_success() {
            bail!("blob store bucket probe failed (HTTP {})", resp.status());
        }
        Ok(())
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let uri = format!("/{}", self.bucket);
        let payload_hash = hex_sha256(b"");

        let head = self
            .request(reqwest::Method::HEAD, &uri, &payload_hash)
            .send()
            .await
            .context("failed to check bucket")?;

        if head.status().is_success() {
            return Ok(());
        }
        if head.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("bucket probe failed (HTTP {})", head.status());
        }

        let create = self
            .request(reqwest::Method::PUT, &uri, &payload_hash)
            .send()
            .await
            .context("failed to create bucket")?;
        if !create.status().is_success() {
            bail!("bucket create failed (HTTP {})", create.status());
        }

        tracing::info!(bucket = %self.bucket, "created blob store bucket");
        Ok(())
    }

    fn object_uri(&self, key: &str) -> String {
        let encoded: Vec<String> = key.split('/').map(uri_encode).collect();
        format!("/{}/{}", self.bucket, encoded.join("/"))
    }

    /// Build a signed request for the given canonical URI.
    fn request(
        &self,
        method: reqwest::Method,
        canonical_uri: &str,
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Header names in sorted order, as SigV4 requires.
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.endpoint, payload_hash, amz_date
        );

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, REGION);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, REGION, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        );

        let url = format!("{}://{}{}", self.scheme, self.endpoint, canonical_uri);
        self.client
            .request(method, url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
    }
}

#[async_trait]
impl Dependency for BlobStore {
    fn name(&self) -> &'static str {
        "minio"
    }

    async fn ping(&self) -> Result<()> {
        BlobStore::ping(self).await
    }
}

// ==================== SigV4 Helpers ====================

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{secret_key}").as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 percent-encoding of everything but unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

// ==================== Content Types ====================

/// Map a file path to a content type by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "txt" | "log" | "conf" | "cfg" | "ini" => "text/plain",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" => "text/html",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "yaml" | "yml" => "application/x-yaml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_mapping() {
        assert_eq!(content_type_for("/data/a.log"), "text/plain");
        assert_eq!(content_type_for("/data/a.json"), "application/json");
        assert_eq!(content_type_for("/data/a.yml"), "application/x-yaml");
        assert_eq!(content_type_for("/data/report.CSV"), "text/csv");
        assert_eq!(content_type_for("/data/a.bin"), "application/octet-stream");
        assert_eq!(content_type_for("/data/noext"), "application/octet-stream");
    }

    #[test]
    fn uri_encode_leaves_hex_keys_untouched() {
        let key = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert_eq!(uri_encode(key), key);
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn signing_key_derivation_is_deterministic() {
        let a = derive_signing_key("secret", "20240101", REGION, "s3");
        let b = derive_signing_key("secret", "20240101", REGION, "s3");
        assert_eq!(a, b);
        let c = derive_signing_key("secret", "20240102", REGION, "s3");
        assert_ne!(a, c);
    }
}

//! Amazon S3 blob store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! so S3-compatible services (MinIO, LocalStack) work through
//! `endpoint_url`. Object paths are stored under the configured key prefix.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//!
//! [storage.s3]
//! bucket = "docai-blobs"
//! prefix = "prod/"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional, for temporary credentials)
//!
//! # Addressing
//!
//! Without `endpoint_url`, virtual-hosted style is used
//! (`https://<bucket>.s3.<region>.amazonaws.com/<key>`). With a custom
//! endpoint, path style is used (`<endpoint>/<bucket>/<key>`), which is what
//! MinIO and LocalStack expect.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

use crate::blob::{is_direct_child, validate_path, BlobEntry, BlobStore};
use crate::config::S3StorageConfig;
use crate::error::StorageError;

pub struct S3BlobStore {
    config: S3StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(config: S3StorageConfig, creds: AwsCredentials) -> Self {
        Self {
            config,
            creds,
            client: reqwest::Client::new(),
        }
    }

    /// Create a store with credentials read from the `AWS_*` environment.
    pub fn from_env(config: S3StorageConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config, AwsCredentials::from_env()?))
    }

    fn key_for(&self, path: &str) -> String {
        if self.config.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_end_matches('/'), path)
        }
    }

    fn path_for(&self, key: &str) -> String {
        if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            let prefix = self.config.prefix.trim_end_matches('/');
            key.strip_prefix(prefix)
                .map(|s| s.trim_start_matches('/').to_string())
                .unwrap_or_else(|| key.to_string())
        }
    }

    /// Send a signed request. `key` is `None` for bucket-level operations.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        body: Vec<u8>,
    ) -> anyhow::Result<reqwest::Response> {
        let endpoint = Endpoint::for_config(&self.config);
        let canonical_uri = endpoint.canonical_uri(&self.config.bucket, key);

        let mut sorted_params = query.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = sha256_hex(&body);

        let mut headers = vec![
            ("host".to_string(), endpoint.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
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
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature =
            SigningKey::derive(&self.creds.secret_access_key, &date_stamp, &self.config.region)
                .sign(&string_to_sign);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", endpoint.scheme, endpoint.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if method == Method::PUT || !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .with_context(|| format!("S3 {} {} failed", method, url))
    }
}

/// Turn a non-success response into a [`StorageError`].
async fn status_error(resp: reqwest::Response, op: &str, path: &str) -> StorageError {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return StorageError::NotFound(path.to_string());
    }
    let body = resp.text().await.unwrap_or_default();
    StorageError::Transient(anyhow::anyhow!(
        "S3 {} failed (HTTP {}) for '{}': {}",
        op,
        status,
        path,
        body.chars().take(500).collect::<String>()
    ))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn backend(&self) -> &str {
        "s3"
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_path(path)?;
        let key = self.key_for(path);
        let resp = self.send(Method::PUT, Some(&key), &[], data.to_vec()).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp, "PutObject", path).await);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_path(path)?;
        let key = self.key_for(path);
        let resp = self.send(Method::HEAD, Some(&key), &[], Vec::new()).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(resp, "HeadObject", path).await),
        }
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_path(path)?;
        let key = self.key_for(path);
        let resp = self.send(Method::GET, Some(&key), &[], Vec::new()).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp, "GetObject", path).await);
        }
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read s3 object body for '{}'", path))?;
        Ok(bytes.to_vec())
    }

    fn url(&self, path: &str) -> String {
        let endpoint = Endpoint::for_config(&self.config);
        let key = self.key_for(path);
        format!(
            "{}://{}{}",
            endpoint.scheme,
            endpoint.host,
            endpoint.canonical_uri(&self.config.bucket, Some(&key))
        )
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let key_prefix = self.key_for(prefix);
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("delimiter".to_string(), "/".to_string()),
                ("prefix".to_string(), key_prefix.clone()),
            ];
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.send(Method::GET, None, &query, Vec::new()).await?;
            if !resp.status().is_success() {
                return Err(status_error(resp, "ListObjectsV2", prefix).await);
            }
            let xml = resp
                .text()
                .await
                .context("Failed to read ListObjectsV2 response")?;
            let page = ListPage::parse(&xml);

            for key in page.keys {
                let path = self.path_for(&key);
                if is_direct_child(prefix, &path) {
                    entries.push(BlobEntry::from_path(path));
                }
            }

            match page.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        // S3 DELETE succeeds for missing keys, so check first to keep the
        // NotFound contract.
        if !self.exists(path).await? {
            return Err(StorageError::NotFound(path.to_string()));
        }
        let key = self.key_for(path);
        let resp = self
            .send(Method::DELETE, Some(&key), &[], Vec::new())
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp, "DeleteObject", path).await);
        }
        Ok(())
    }
}

/// Access keys for request signing.
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Read `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`, plus
    /// `AWS_SESSION_TOKEN` when present.
    pub fn from_env() -> anyhow::Result<Self> {
        let required = |name: &str| {
            std::env::var(name).with_context(|| format!("{} must be set for the s3 blob store", name))
        };
        Ok(Self {
            access_key_id: required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }
}

struct Endpoint {
    scheme: &'static str,
    host: String,
    path_style: bool,
}

impl Endpoint {
    fn for_config(config: &S3StorageConfig) -> Self {
        match config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                Self {
                    scheme,
                    host,
                    path_style: true,
                }
            }
            None => Self {
                scheme: "https",
                host: format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                path_style: false,
            },
        }
    }

    fn canonical_uri(&self, bucket: &str, key: Option<&str>) -> String {
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        match (self.path_style, key) {
            (true, Some(_)) => format!("/{}/{}", uri_encode(bucket), encoded_key),
            (true, None) => format!("/{}", uri_encode(bucket)),
            (false, Some(_)) => format!("/{}", encoded_key),
            (false, None) => "/".to_string(),
        }
    }
}

/// Per-day SigV4 key for the `s3` service in one region.
struct SigningKey([u8; 32]);

impl SigningKey {
    fn derive(secret: &str, date_stamp: &str, region: &str) -> Self {
        let mut key = mac(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
        for part in [region.as_bytes(), b"s3".as_slice(), b"aws4_request".as_slice()] {
            key = mac(&key, part);
        }
        Self(key)
    }

    fn sign(&self, string_to_sign: &str) -> String {
        hex::encode(mac(&self.0, string_to_sign.as_bytes()))
    }
}

fn mac(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut m = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac key");
    m.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&m.finalize().into_bytes());
    out
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 percent-encoding; only unreserved characters pass through.
fn uri_encode(s: &str) -> String {
    s.bytes().fold(String::with_capacity(s.len()), |mut out, b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
        out
    })
}

/// One page of a `ListObjectsV2` response.
#[derive(Debug, Default)]
struct ListPage {
    keys: Vec<String>,
    /// Set only when the listing is truncated.
    next_token: Option<String>,
}

impl ListPage {
    fn parse(xml: &str) -> Self {
        let truncated = tag_text(xml, "IsTruncated") == Some("true");
        let keys = xml
            .split("<Contents>")
            .skip(1)
            .filter_map(|block| tag_text(block, "Key"))
            .filter(|key| !key.is_empty() && !key.ends_with('/'))
            .map(xml_unescape)
            .collect();
        Self {
            keys,
            next_token: tag_text(xml, "NextContinuationToken")
                .filter(|_| truncated)
                .map(str::to_string),
        }
    }
}

fn tag_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let (_, rest) = xml.split_once(&format!("<{}>", tag))?;
    let (text, _) = rest.split_once(&format!("</{}>", tag))?;
    Some(text)
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefix: &str, endpoint: Option<&str>) -> S3StorageConfig {
        S3StorageConfig {
            bucket: "docai".to_string(),
            prefix: prefix.to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: endpoint.map(str::to_string),
        }
    }

    fn store(prefix: &str, endpoint: Option<&str>) -> S3BlobStore {
        S3BlobStore::new(
            config(prefix, endpoint),
            AwsCredentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
        )
    }

    #[test]
    fn keys_carry_prefix() {
        let s = store("prod/", None);
        assert_eq!(s.key_for("u1/a.md"), "prod/u1/a.md");
        assert_eq!(s.path_for("prod/u1/a.md"), "u1/a.md");

        let s = store("", None);
        assert_eq!(s.key_for("u1/a.md"), "u1/a.md");
    }

    #[test]
    fn urls_by_addressing_style() {
        assert_eq!(
            store("", None).url("u1/my doc.md"),
            "https://docai.s3.us-east-1.amazonaws.com/u1/my%20doc.md"
        );
        assert_eq!(
            store("", Some("http://localhost:9000/")).url("u1/a.md"),
            "http://localhost:9000/docai/u1/a.md"
        );
    }

    #[test]
    fn parses_listing() {
        let xml = r#"<ListBucketResult>
<IsTruncated>true</IsTruncated>
<NextContinuationToken>tok</NextContinuationToken>
<Contents><Key>u1/a.md</Key><Size>3</Size></Contents>
<Contents><Key>u1/</Key></Contents>
<Contents><Key>u1/R&amp;D.md</Key></Contents>
</ListBucketResult>"#;
        let page = ListPage::parse(xml);
        assert_eq!(page.keys, vec!["u1/a.md", "u1/R&D.md"]);
        assert_eq!(page.next_token.as_deref(), Some("tok"));

        let last = ListPage::parse(
            "<ListBucketResult><IsTruncated>false</IsTruncated>\
             <NextContinuationToken>stale</NextContinuationToken></ListBucketResult>",
        );
        assert!(last.keys.is_empty());
        assert!(last.next_token.is_none());
    }

    #[test]
    fn signing_key_is_deterministic() {
        let a = SigningKey::derive("secret", "20240101", "us-east-1").sign("payload");
        let b = SigningKey::derive("secret", "20240101", "us-east-1").sign("payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(
            a,
            SigningKey::derive("secret", "20240102", "us-east-1").sign("payload")
        );
    }

    #[test]
    fn uri_encoding() {
        assert_eq!(uri_encode("a b/c~"), "a%20b%2Fc~");
    }
}

//! Path-style S3 backend.
//!
//! Speaks the minimal subset of the S3 HTTP API the service needs (GET and
//! PUT object) with AWS Signature Version 4 request signing. Path-style
//! addressing keeps B2- and MinIO-compatible endpoints working.

use crate::config::BucketConfig;
use crate::errors::{ConfigError, StorageError};
use crate::storage::ObjectBackend;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

pub struct S3Backend {
    client: reqwest::Client,
    endpoint: Url,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Backend {
    /// Resolves the bucket's credentials from the environment and builds a
    /// signing client for its endpoint.
    pub fn from_bucket(bucket: &BucketConfig) -> Result<Self, ConfigError> {
        let endpoint_raw = bucket.url.resolve()?;
        let endpoint = Url::parse(&endpoint_raw).map_err(|source| ConfigError::InvalidUrl {
            domain: String::new(),
            field: "bucket.url",
            source,
        })?;

        let region = match bucket.region.resolve()? {
            region if region.is_empty() => "us-east-1".to_string(),
            region => region,
        };

        Ok(S3Backend {
            client: reqwest::Client::new(),
            endpoint,
            bucket: bucket.name.resolve()?,
            region,
            access_key: bucket.application_id.resolve()?,
            secret_key: bucket.secret.resolve()?,
        })
    }

    fn object_url(&self, key: &str) -> String {
        let base = self.endpoint.as_str().trim_end_matches('/');
        format!("{base}/{}/{}", self.bucket, uri_encode(key, false))
    }

    fn canonical_uri(&self, key: &str) -> String {
        format!("/{}/{}", uri_encode(&self.bucket, false), uri_encode(key, false))
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Computes the SigV4 headers for one request: `x-amz-date`,
    /// `x-amz-content-sha256`, and `authorization`.
    fn sign(
        &self,
        method: &str,
        key: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> [(&'static str, String); 3] {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = sha256_hex(payload);
        let scope = format!("{date}/{}/s3/aws4_request", self.region);

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n",
            self.host_header()
        );
        let canonical_request = format!(
            "{method}\n{}\n\n{canonical_headers}\n{SIGNED_HEADERS}\n{payload_hash}",
            self.canonical_uri(key)
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let mut signing_key = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        for part in [self.region.as_bytes(), b"s3", b"aws4_request"] {
            signing_key = hmac(&signing_key, part);
        }
        let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, \
             Signature={signature}",
            self.access_key
        );

        [
            ("x-amz-date", amz_date),
            ("x-amz-content-sha256", payload_hash),
            ("authorization", authorization),
        ]
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let mut request = self.client.get(self.object_url(key));
        for (name, value) in self.sign("GET", key, b"", Utc::now()) {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?)),
            status => Err(StorageError::Unexpected {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put(self.object_url(key))
            .header("content-type", content_type);
        for (name, value) in self.sign("PUT", key, &data, Utc::now()) {
            request = request.header(name, value);
        }

        let response = request.body(data).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Unexpected {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 percent-encoding with the unreserved set AWS expects; `/` is
/// kept verbatim in object keys.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_value::EnvValue;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(endpoint: &str) -> S3Backend {
        S3Backend::from_bucket(&BucketConfig {
            url: EnvValue::new(endpoint),
            name: EnvValue::new("pages-bucket"),
            application_id: EnvValue::new("AKIDEXAMPLE"),
            secret: EnvValue::new("wJalrXUtnFEMI"),
            region: EnvValue::new("eu-central-1"),
        })
        .unwrap()
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("org/repo/index.yaml", false), "org/repo/index.yaml");
        assert_eq!(uri_encode("a b", false), "a%20b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("commit~1.html", false), "commit~1.html");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let backend = backend("http://storage.local:9000");
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = backend.sign("GET", "org/repo/index.yaml", b"", now);
        let second = backend.sign("GET", "org/repo/index.yaml", b"", now);
        assert_eq!(first, second);

        assert_eq!(first[0].1, "20240501T120000Z");
        // empty-payload SHA-256 is a fixed constant
        assert_eq!(
            first[1].1,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let auth = &first[2].1;
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/eu-central-1/s3/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[test]
    fn test_signature_depends_on_inputs() {
        let backend = backend("http://storage.local:9000");
        let now = Utc::now();
        let a = backend.sign("GET", "org/repo/a", b"", now);
        let b = backend.sign("GET", "org/repo/b", b"", now);
        assert_ne!(a[2].1, b[2].1);
    }

    #[tokio::test]
    async fn test_get_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pages-bucket/org/repo/index.yaml"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200).set_body_string("abc: {}"))
            .mount(&server)
            .await;

        let backend = backend(&server.uri());
        let body = backend.get("org/repo/index.yaml").await.unwrap().unwrap();
        assert_eq!(body.as_ref(), b"abc: {}");
    }

    #[tokio::test]
    async fn test_get_missing_object_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = backend(&server.uri());
        assert!(backend.get("org/repo/index.yaml").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let backend = backend(&server.uri());
        let err = backend.get("org/repo/index.yaml").await.unwrap_err();
        assert!(matches!(err, StorageError::Unexpected { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_put_object() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/pages-bucket/org/repo/abc/index.html"))
            .and(header("content-type", "text/html"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend(&server.uri());
        backend
            .put(
                "org/repo/abc/index.html",
                Bytes::from_static(b"<html></html>"),
                "text/html",
            )
            .await
            .unwrap();
    }
}

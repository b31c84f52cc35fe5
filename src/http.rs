//! HTTP client core.
//!
//! A thin wrapper over one shared `reqwest::Client` (connection pool) that
//! every provider and the catalog loader use. Handles base-URL composition,
//! request timing/logging and status-to-error mapping. No retries here;
//! the collector owns retry policy.

use std::io::Read;
use std::time::Instant;

use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::AppError;

/// Per-request timeout (seconds).
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Upper bound on idle pooled connections per host. Roughly matches the
/// number of concurrent in-flight requests the collector fan-out produces.
const POOL_MAX_IDLE_PER_HOST: usize = 50;

/// Build the process-wide HTTP client shared across all providers.
pub fn build_shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .expect("Failed to build HTTP client")
}

/// A base-URL-scoped view over the shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        let base_url = if let Some(trimmed) = base_url.strip_suffix('/') {
            tracing::warn!(
                "Base URL \"{}\" has a trailing slash, trimming it",
                base_url
            );
            trimmed.to_string()
        } else {
            base_url.to_string()
        };

        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn execute(
        &self,
        method: &str,
        url: String,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AppError> {
        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            tracing::warn!("{} {} failed: {}", method, url, e);
            AppError::Network(e.to_string())
        })?;

        let status = response.status();
        tracing::info!(
            "{} {} -> {} ({} ms)",
            method,
            url,
            status.as_u16(),
            started.elapsed().as_millis(),
        );

        if status.as_u16() >= 400 {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response)
    }

    /// GET a JSON body, decoded into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let url = self.url(path);
        let builder = self.client.get(&url).query(query);
        let response = self.execute("GET", url.clone(), builder).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::Decode(format!("{}: {}", url, e)))
    }

    /// POST a JSON body, decoding the JSON response into `T`.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &impl Serialize,
    ) -> Result<T, AppError> {
        let url = self.url(path);
        let builder = self.client.post(&url).query(query).json(body);
        let response = self.execute("POST", url.clone(), builder).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::Decode(format!("{}: {}", url, e)))
    }

    /// GET a raw body as bytes, no decoding.
    pub async fn get_raw(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<u8>, AppError> {
        let url = self.url(path);
        let builder = self.client.get(&url).query(query);
        let response = self.execute("GET", url.clone(), builder).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Network(format!("{}: {}", url, e)))?;
        Ok(body.to_vec())
    }

    /// GET a gzip-compressed body and decompress it. For `.gz` file
    /// downloads, where the compression is part of the payload rather than
    /// a `Content-Encoding` the pool would strip transparently.
    pub async fn get_gzipped(&self, path: &str) -> Result<Vec<u8>, AppError> {
        let raw = self.get_raw(path, &[]).await?;
        gunzip(&raw)
    }
}

fn gunzip(raw: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut decoder = GzDecoder::new(raw);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| AppError::Decode(format!("gzip decompression failed: {}", e)))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::Value;
    use std::io::Write;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_get_json_with_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/archive"))
            .and(query_param("latitude", "35.6897"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "latitude": 35.6897
            })))
            .mount(&server)
            .await;

        let client = HttpClient::new(build_shared_client(), &server.uri());
        let body: Value = client
            .get_json("/v1/archive", &[("latitude", "35.6897".to_string())])
            .await
            .unwrap();
        assert_eq!(body["latitude"], 35.6897);
    }

    #[tokio::test]
    async fn test_status_404_maps_to_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpClient::new(build_shared_client(), &server.uri());
        let err = client
            .get_json::<Value>("/v1/missing", &[])
            .await
            .unwrap_err();
        match err {
            AppError::HttpStatus { status, url } => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/v1/missing"));
            }
            other => panic!("expected HttpStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trailing_slash_on_base_is_trimmed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let base = format!("{}/", server.uri());
        let client = HttpClient::new(build_shared_client(), &base);
        // A doubled slash in the path would miss the mock matcher.
        let body: Value = client.get_json("/ping", &[]).await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_missing_leading_slash_is_added() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = HttpClient::new(build_shared_client(), &server.uri());
        let body: Value = client.get_json("ping", &[]).await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_get_gzipped_decompresses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stations/lite.json.gz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(gzip_bytes(b"[{\"id\":\"10637\"}]")),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new(build_shared_client(), &server.uri());
        let body = client.get_gzipped("/stations/lite.json.gz").await.unwrap();
        assert_eq!(body, b"[{\"id\":\"10637\"}]");
    }

    #[tokio::test]
    async fn test_truncated_gzip_is_decode_error() {
        let server = MockServer::start().await;
        let mut gz = gzip_bytes(b"0123456789");
        gz.truncate(gz.len() / 2);
        Mock::given(method("GET"))
            .and(path("/broken.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gz))
            .mount(&server)
            .await;

        let client = HttpClient::new(build_shared_client(), &server.uri());
        let err = client.get_gzipped("/broken.gz").await.unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
    }
}

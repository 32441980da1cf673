use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use fileflow_core::{AppError, AppResult, FetchedResource, HttpFetcher};
use reqwest::Client;
use std::time::Duration;

/// Fetches remote resources for download tasks
#[derive(Clone)]
pub struct ReqwestHttpFetcher {
    client: Client,
    max_bytes: u64,
}

impl ReqwestHttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Fileflow-Downloader/1.0")
            .build()
            .context("Failed to create HTTP client for downloads")?;
        Ok(Self { client, max_bytes })
    }

    fn too_large(&self, url: &str) -> AppError {
        AppError::external(
            "http",
            format!("Response from {} exceeds {} bytes", url, self.max_bytes),
        )
    }
}

#[async_trait]
impl HttpFetcher for ReqwestHttpFetcher {
    #[tracing::instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &str) -> AppResult<FetchedResource> {
        let start = std::time::Instant::now();
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::external("http", format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::external(
                "http",
                format!("URL returned status code: {}", response.status().as_u16()),
            ));
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes)
        {
            return Err(self.too_large(url));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AppError::external("http", format!("Failed to read body: {}", e)))?
        {
            if body.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(
            size_bytes = body.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Fetched remote resource"
        );

        Ok(FetchedResource {
            content_type,
            body: body.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_returns_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cat.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/png")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;

        let fetcher = ReqwestHttpFetcher::new(Duration::from_secs(5), 1024).unwrap();
        let fetched = fetcher
            .fetch(&format!("{}/cat.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
        assert_eq!(fetched.body.as_ref(), &[1u8, 2, 3]);
    }

    #[tokio::test]
    async fn test_non_success_status_is_in_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = ReqwestHttpFetcher::new(Duration::from_secs(5), 1024).unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let fetcher = ReqwestHttpFetcher::new(Duration::from_secs(5), 16).unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}

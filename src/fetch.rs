//! Remote image fetching
//!
//! The pipeline pulls bytes through the [`ImageSource`] trait so tests can
//! substitute a canned source; [`HttpImageSource`] is the production
//! implementation over a shared `reqwest` client.

use crate::error::{Result, TransferError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;

/// Bytes fetched for one task, with the content type the server reported.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedAsset {
    /// Content type to forward downstream, defaulting to JPEG the way the
    /// upstream image hosts do.
    #[must_use]
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or("image/jpeg")
    }
}

/// Source of remote image bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch the asset at `url`.
    ///
    /// # Errors
    /// - Connection or transport failure
    /// - Non-success HTTP status (carried as [`TransferError::Status`])
    async fn fetch(&self, url: &str) -> Result<FetchedAsset>;
}

/// HTTP image source backed by a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpImageSource {
    client: Client,
}

impl HttpImageSource {
    /// Create a source with the given per-request timeout.
    ///
    /// # Errors
    /// - Failed to build the HTTP client
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::network_error("Failed to create HTTP client", e))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared with the object-store layer).
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::network_error(format!("Failed to fetch {}", url), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let expected = response.content_length().unwrap_or(0) as usize;
        let mut bytes = Vec::with_capacity(expected);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                TransferError::network_error(format!("Failed to read body of {}", url), e)
            })?;
            bytes.extend_from_slice(&chunk);
        }

        log::debug!("fetched {} ({} bytes)", url, bytes.len());

        Ok(FetchedAsset {
            bytes,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_default() {
        let asset = FetchedAsset {
            bytes: vec![1, 2, 3],
            content_type: None,
        };
        assert_eq!(asset.content_type_or_default(), "image/jpeg");

        let asset = FetchedAsset {
            bytes: vec![],
            content_type: Some("image/png".to_string()),
        };
        assert_eq!(asset.content_type_or_default(), "image/png");
    }

    #[tokio::test]
    async fn test_source_creation() {
        let _source = HttpImageSource::new(Duration::from_secs(5)).expect("client builds");
    }
}

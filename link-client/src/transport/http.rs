//! Presigned-URL uploads over HTTP.

use super::{BlobUploader, TransportError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// Default timeout for a single PUT.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// [`BlobUploader`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    /// Create an uploader with the default timeout.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_UPLOAD_TIMEOUT)
    }

    /// Create an uploader with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Upload(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobUploader for HttpUploader {
    async fn put(
        &self,
        url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Upload(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Upload(format!("HTTP {}", status)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_is_upload_error() {
        let uploader = HttpUploader::with_timeout(Duration::from_secs(2)).unwrap();
        let result = uploader
            .put("http://127.0.0.1:9/presigned", vec![1, 2, 3], "image/png")
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let uploader = HttpUploader::new().unwrap();
        let result = uploader.put("not a url", vec![], "image/png").await;
        assert!(matches!(result, Err(TransportError::Upload(_))));
    }
}

//! Signed-URL collaborator interface.
//!
//! The artifact-metadata service is the only component that knows where
//! archive bytes actually live; it vends short-lived signed URLs for dataset
//! members. The core consumes it through [`SignedUrlProvider`] so tests can
//! substitute a stub and the production deployment can point at the real
//! service.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Collaborator that vends signed download URLs for dataset members.
#[async_trait]
pub trait SignedUrlProvider: Send + Sync {
    /// Return a signed URL for `path` within `dataset`.
    ///
    /// `path` is dataset-relative: `"{timestamp}/{channel}.zip"` for archives,
    /// `"{timestamp}/{channel}/scale{z}/{y}.{x}"` for the legacy unpacked
    /// layout.
    async fn signed_url(&self, dataset: &str, path: &str) -> Result<String>;
}

/// HTTP implementation against the artifact-metadata service.
///
/// `GET {base}/{dataset}/files/{path}` returns the signed URL as the plain
/// response body; any non-success status is a refusal.
#[derive(Debug, Clone)]
pub struct HttpSignedUrlProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSignedUrlProvider {
    /// Create a provider for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, dataset: &str, path: &str) -> String {
        format!("{}/{}/files/{}", self.base_url, dataset, path)
    }
}

#[async_trait]
impl SignedUrlProvider for HttpSignedUrlProvider {
    async fn signed_url(&self, dataset: &str, path: &str) -> Result<String> {
        let endpoint = self.endpoint(dataset, path);
        debug!("Requesting signed URL: {endpoint}");

        let response = self.client.get(&endpoint).send().await.map_err(|e| {
            Error::url_unavailable(dataset, path, e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::url_unavailable(
                dataset,
                path,
                format!("metadata service returned {status}"),
            ));
        }

        let url = response
            .text()
            .await
            .map_err(|e| Error::url_unavailable(dataset, path, e.to_string()))?;
        let url = url.trim().trim_matches('"').to_string();
        if url.is_empty() {
            return Err(Error::url_unavailable(dataset, path, "empty URL body"));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_signed_url_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ds1/files/t1/BF_LED_matrix_full.zip"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("https://bucket/archive.zip?sig=x"),
            )
            .mount(&server)
            .await;

        let provider =
            HttpSignedUrlProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let url = provider
            .signed_url("ds1", "t1/BF_LED_matrix_full.zip")
            .await
            .unwrap();
        assert_eq!(url, "https://bucket/archive.zip?sig=x");
    }

    #[tokio::test]
    async fn test_refusal_maps_to_url_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider =
            HttpSignedUrlProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = provider.signed_url("ds1", "t1/x.zip").await.unwrap_err();
        assert!(matches!(err, Error::UrlUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_quoted_json_body_is_unwrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"https://bucket/a.zip\""))
            .mount(&server)
            .await;

        let provider =
            HttpSignedUrlProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let url = provider.signed_url("ds", "p").await.unwrap();
        assert_eq!(url, "https://bucket/a.zip");
    }
}

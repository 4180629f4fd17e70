//! Ranged HTTP transport for archive bytes.
//!
//! All archive I/O goes through ranged GETs against signed URLs: a suffix
//! fetch to locate the directory, then exact member ranges. Requests retry
//! transient failures with exponential backoff and jitter; a 403 is surfaced
//! immediately as an expired signature so the caller can refresh its lease
//! instead of burning retries.

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Default maximum retries for transient failures.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default initial backoff in milliseconds.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff in milliseconds.
const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

/// Default backoff multiplier.
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (0.0 to 1.0).
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default per-operation deadline.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(50);

/// Result of a suffix fetch: the tail bytes plus the total object size
/// reported by `Content-Range`.
#[derive(Debug, Clone)]
pub struct TailFetch {
    /// The final bytes of the object
    pub bytes: Bytes,
    /// Total object size in bytes
    pub file_size: u64,
}

/// HTTP client for ranged archive reads.
#[derive(Debug)]
pub struct RangeTransport {
    client: Client,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
    op_timeout: Duration,
}

impl RangeTransport {
    /// Create a transport with the default per-operation deadline.
    pub fn new() -> Result<Self> {
        Self::with_op_timeout(DEFAULT_OP_TIMEOUT)
    }

    /// Create a transport with a custom per-operation deadline.
    pub fn with_op_timeout(op_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(op_timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .build()?;

        Ok(Self {
            client,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            op_timeout,
        })
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial backoff duration in milliseconds.
    pub fn with_initial_backoff_ms(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    /// Calculate backoff for a retry attempt, with jitter.
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * 2.0 * jitter_range - jitter_range;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Execute a GET with optional `Range` header, retrying transient failures.
    async fn execute(&self, url: &str, range: Option<&str>, offset: u64, len: u64) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.calculate_backoff(attempt - 1);
                debug!("Transport retry {attempt} after {backoff:?}");
                sleep(backoff).await;
            }

            let mut request = self.client.get(url);
            if let Some(range) = range {
                request = request.header(reqwest::header::RANGE, range);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    trace!("Transport response {status} for range {range:?}");

                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::FORBIDDEN {
                        // Expired or invalid signature; retrying the same URL
                        // cannot succeed, the lease must be refreshed.
                        return Err(Error::ExpiredSignature { status: status.as_u16() });
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(Error::ArchiveNotFound);
                    }
                    let retryable = status.is_server_error()
                        || status == StatusCode::TOO_MANY_REQUESTS;
                    if retryable && attempt < self.max_retries {
                        warn!("Transport status {status} (attempt {}), will retry", attempt + 1);
                        last_error = Some(Error::RangeStatus {
                            status: status.as_u16(),
                            offset,
                            len,
                        });
                        continue;
                    }
                    return Err(Error::RangeStatus { status: status.as_u16(), offset, len });
                }
                Err(e) => {
                    let retryable = e.is_connect() || e.is_timeout() || e.is_request();
                    let mapped = if e.is_timeout() {
                        Error::Timeout { duration_ms: self.op_timeout.as_millis() as u64 }
                    } else {
                        Error::Http(e)
                    };
                    if retryable && attempt < self.max_retries {
                        warn!("Transport error (attempt {}): {mapped}, will retry", attempt + 1);
                        last_error = Some(mapped);
                    } else {
                        return Err(mapped);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::invalid_response("all retry attempts failed")))
    }

    /// Fetch exactly `len` bytes starting at `offset`.
    ///
    /// Hosts that ignore the `Range` header and return the whole object are
    /// tolerated by slicing the body; no more than the object is ever read.
    pub async fn get_range(&self, url: &str, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let response = self.execute(url, Some(&range), offset, len).await?;
        let ranged = response.status() == StatusCode::PARTIAL_CONTENT;
        let body = response.bytes().await?;

        let bytes = if ranged {
            body
        } else {
            // Full-object fallback for hosts without range support.
            let start = (offset as usize).min(body.len());
            let end = ((offset + len) as usize).min(body.len());
            body.slice(start..end)
        };

        if bytes.len() != len as usize {
            return Err(Error::invalid_response(format!(
                "range {range} returned {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Fetch the final `len` bytes of the object and report its total size.
    pub async fn get_suffix(&self, url: &str, len: u64) -> Result<TailFetch> {
        let range = format!("bytes=-{len}");
        let response = self.execute(url, Some(&range), 0, len).await?;

        if response.status() == StatusCode::PARTIAL_CONTENT {
            let file_size = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| Error::invalid_response("missing Content-Range on suffix fetch"))?;
            let bytes = response.bytes().await?;
            return Ok(TailFetch { bytes, file_size });
        }

        // Full-object fallback: the body is the whole archive.
        let body = response.bytes().await?;
        let file_size = body.len() as u64;
        let start = body.len().saturating_sub(len as usize);
        Ok(TailFetch { bytes: body.slice(start..), file_size })
    }

    /// Fetch an entire (small) object; used by the legacy unpacked layout
    /// where each chunk is its own member.
    pub async fn get_full(&self, url: &str) -> Result<Bytes> {
        let response = self.execute(url, None, 0, 0).await?;
        Ok(response.bytes().await?)
    }
}

/// Parse the total size out of a `Content-Range: bytes a-b/total` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.strip_prefix("bytes ")?.split('/').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> RangeTransport {
        RangeTransport::new().unwrap().with_initial_backoff_ms(1)
    }

    #[test]
    fn test_content_range_parsing() {
        assert_eq!(parse_content_range_total("bytes 10-19/4096"), Some(4096));
        assert_eq!(parse_content_range_total("bytes */512"), Some(512));
        assert_eq!(parse_content_range_total("items 1-2/3"), None);
    }

    #[tokio::test]
    async fn test_get_range_requests_exact_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=16-31"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 16-31/1024")
                    .set_body_bytes(vec![7u8; 16]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let bytes = transport()
            .get_range(&format!("{}/a.zip", server.uri()), 16, 16)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), &[7u8; 16]);
    }

    #[tokio::test]
    async fn test_suffix_fetch_reports_file_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=-8"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 1016-1023/1024")
                    .set_body_bytes(vec![1u8; 8]),
            )
            .mount(&server)
            .await;

        let tail = transport()
            .get_suffix(&format!("{}/a.zip", server.uri()), 8)
            .await
            .unwrap();
        assert_eq!(tail.file_size, 1024);
        assert_eq!(tail.bytes.len(), 8);
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_expired_signature_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = transport()
            .get_range(&format!("{}/a.zip", server.uri()), 0, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpiredSignature { status: 403 }));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-3/4")
                    .set_body_bytes(vec![9u8; 4]),
            )
            .mount(&server)
            .await;

        let bytes = transport()
            .get_range(&format!("{}/a.zip", server.uri()), 0, 4)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), &[9u8; 4]);
    }

    #[tokio::test]
    async fn test_full_object_fallback_slices_range() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..64).collect();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let bytes = transport()
            .get_range(&format!("{}/a.zip", server.uri()), 10, 4)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), &[10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn test_not_found_is_archive_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = transport()
            .get_full(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArchiveNotFound));
    }
}

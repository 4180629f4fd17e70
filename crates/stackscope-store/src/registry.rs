//! Signed-URL lease registry.
//!
//! Holds one [`UrlLease`] per archive key. `lease` returns the cached entry
//! while its remaining validity clears the safety margin and otherwise
//! refreshes through the collaborator, coalescing concurrent refreshes for
//! the same key into a single call. Expiry is read from the URL's own
//! `X-Amz-Date` / `X-Amz-Expires` query parameters when present.

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::SharedResult;
use crate::provider::SignedUrlProvider;
use crate::singleflight::SingleFlight;
use crate::types::{ArchiveKey, DEFAULT_LEASE_SECS, DEFAULT_SAFETY_MARGIN_SECS, UrlLease};

/// Clock function, injectable for expiry-boundary tests.
pub type Clock = fn() -> u64;

fn system_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of signed-URL leases, one per archive key.
pub struct UrlRegistry {
    provider: Arc<dyn SignedUrlProvider>,
    leases: RwLock<HashMap<ArchiveKey, UrlLease>>,
    refresh: SingleFlight<ArchiveKey, UrlLease>,
    safety_margin: u64,
    clock: Clock,
}

impl UrlRegistry {
    /// Create a registry with the default safety margin.
    pub fn new(provider: Arc<dyn SignedUrlProvider>) -> Self {
        Self::with_safety_margin(provider, DEFAULT_SAFETY_MARGIN_SECS)
    }

    /// Create a registry with a custom safety margin in seconds.
    pub fn with_safety_margin(provider: Arc<dyn SignedUrlProvider>, safety_margin: u64) -> Self {
        Self {
            provider,
            leases: RwLock::new(HashMap::new()),
            refresh: SingleFlight::new(),
            safety_margin,
            clock: system_now,
        }
    }

    /// Replace the wall clock; tests use this to walk leases to their edge.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current time, seconds since the Unix epoch.
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Return a lease for `key` valid for at least the safety margin.
    ///
    /// Concurrent callers hitting an expired or missing lease share one
    /// refresh; callers for different keys refresh independently. A refusal
    /// from the collaborator is delivered to every waiter.
    pub async fn lease(&self, key: &ArchiveKey) -> SharedResult<UrlLease> {
        let now = self.now();
        if let Some(lease) = self.leases.read().get(key) {
            if lease.is_fresh(now, self.safety_margin) {
                return Ok(lease.clone());
            }
            debug!("Lease for {key} inside safety margin, refreshing");
        }

        self.refresh
            .run(key.clone(), async {
                // A refresh that finished while this caller queued on the
                // same key satisfies it without another collaborator call.
                let now = self.now();
                if let Some(lease) = self.leases.read().get(key) {
                    if lease.is_fresh(now, self.safety_margin) {
                        return Ok(lease.clone());
                    }
                }

                let path = key.member_path();
                let url = self
                    .provider
                    .signed_url(&key.dataset, &path)
                    .await
                    .map_err(Arc::new)?;
                let expires_at = expiry_from_url(&url, now);
                let lease = UrlLease { url, expires_at };
                debug!(
                    "Refreshed lease for {key}, {}s of validity",
                    lease.remaining(now)
                );
                self.leases.write().insert(key.clone(), lease.clone());
                Ok(lease)
            })
            .await
    }

    /// Drop any cached lease for `key`.
    pub fn invalidate(&self, key: &ArchiveKey) {
        if self.leases.write().remove(key).is_some() {
            debug!("Invalidated lease for {key}");
        }
    }

    /// Number of live leases.
    pub fn len(&self) -> usize {
        self.leases.read().len()
    }

    /// Whether the registry holds no leases.
    pub fn is_empty(&self) -> bool {
        self.leases.read().is_empty()
    }
}

/// Extract the absolute expiry from a signed URL's query parameters.
///
/// AWS SigV4 presigned URLs carry `X-Amz-Date` (ISO 8601 basic) and
/// `X-Amz-Expires` (seconds). Anything unparsable falls back to a default
/// one-hour lease from `now`.
fn expiry_from_url(url: &str, now: u64) -> u64 {
    let fallback = now + DEFAULT_LEASE_SECS;
    let Ok(parsed) = url::Url::parse(url) else {
        warn!("Signed URL did not parse; assuming {DEFAULT_LEASE_SECS}s lease");
        return fallback;
    };

    let mut date: Option<String> = None;
    let mut expires: Option<u64> = None;
    for (name, value) in parsed.query_pairs() {
        match name.as_ref() {
            "X-Amz-Date" => date = Some(value.into_owned()),
            "X-Amz-Expires" => expires = value.parse().ok(),
            _ => {}
        }
    }

    match (date, expires) {
        (Some(date), Some(expires)) => {
            match NaiveDateTime::parse_from_str(&date, "%Y%m%dT%H%M%SZ") {
                Ok(stamp) => stamp.and_utc().timestamp().max(0) as u64 + expires,
                Err(e) => {
                    warn!("Unparsable X-Amz-Date {date}: {e}; assuming default lease");
                    fallback
                }
            }
        }
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    struct CountingProvider {
        calls: AtomicUsize,
        url: String,
        refuse: bool,
    }

    impl CountingProvider {
        fn new(url: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                url: url.to_string(),
                refuse: false,
            }
        }
    }

    #[async_trait]
    impl SignedUrlProvider for CountingProvider {
        async fn signed_url(&self, dataset: &str, path: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if self.refuse {
                return Err(Error::url_unavailable(dataset, path, "refused"));
            }
            Ok(self.url.clone())
        }
    }

    fn key() -> ArchiveKey {
        ArchiveKey {
            dataset: "ds".to_string(),
            timestamp: "t".to_string(),
            channel: crate::types::ChannelId::BrightField,
        }
    }

    #[test]
    fn test_expiry_from_presigned_url() {
        // 2024-01-01T00:00:00Z = 1704067200
        let url = "https://bucket/a.zip?X-Amz-Date=20240101T000000Z&X-Amz-Expires=60&X-Amz-Signature=s";
        assert_eq!(expiry_from_url(url, 0), 1704067200 + 60);
    }

    #[test]
    fn test_expiry_fallback_without_parameters() {
        assert_eq!(
            expiry_from_url("https://bucket/a.zip?token=x", 1000),
            1000 + DEFAULT_LEASE_SECS
        );
        assert_eq!(expiry_from_url("not a url", 1000), 1000 + DEFAULT_LEASE_SECS);
    }

    #[tokio::test]
    async fn test_short_lease_triggers_immediate_refresh() {
        // Lease expires 60s after 2024-01-01T00:00:00Z; with a 300s margin a
        // call at that instant must refresh rather than serve the cached URL.
        let url = "https://bucket/a.zip?X-Amz-Date=20240101T000000Z&X-Amz-Expires=60";
        let provider = Arc::new(CountingProvider::new(url));
        let registry = UrlRegistry::with_safety_margin(
            Arc::clone(&provider) as Arc<dyn SignedUrlProvider>,
            300,
        )
        .with_clock(|| 1704067200);

        registry.lease(&key()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // Still within the margin, so the second call refreshes again.
        registry.lease(&key()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fresh_lease_is_served_from_cache() {
        let url = "https://bucket/a.zip?X-Amz-Date=20240101T000000Z&X-Amz-Expires=7200";
        let provider = Arc::new(CountingProvider::new(url));
        let registry = UrlRegistry::with_safety_margin(
            Arc::clone(&provider) as Arc<dyn SignedUrlProvider>,
            300,
        )
        .with_clock(|| 1704067200);

        let first = registry.lease(&key()).await.unwrap();
        let second = registry.lease(&key()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_leases_share_one_refresh() {
        let url = "https://bucket/a.zip?X-Amz-Date=20240101T000000Z&X-Amz-Expires=7200";
        let provider = Arc::new(CountingProvider::new(url));
        let registry = Arc::new(
            UrlRegistry::with_safety_margin(
                Arc::clone(&provider) as Arc<dyn SignedUrlProvider>,
                300,
            )
            .with_clock(|| 1704067200),
        );

        let barrier = Arc::new(Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.lease(&key()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refusal_reaches_all_waiters_without_extra_calls() {
        let mut inner = CountingProvider::new("https://bucket/a.zip");
        inner.refuse = true;
        let provider = Arc::new(inner);
        let registry = Arc::new(UrlRegistry::new(
            Arc::clone(&provider) as Arc<dyn SignedUrlProvider>
        ));

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.lease(&key()).await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(*err, Error::UrlUnavailable { .. }));
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let url = "https://bucket/a.zip?X-Amz-Date=20240101T000000Z&X-Amz-Expires=7200";
        let provider = Arc::new(CountingProvider::new(url));
        let registry = UrlRegistry::with_safety_margin(
            Arc::clone(&provider) as Arc<dyn SignedUrlProvider>,
            300,
        )
        .with_clock(|| 1704067200);

        registry.lease(&key()).await.unwrap();
        registry.invalidate(&key());
        assert!(registry.is_empty());
        registry.lease(&key()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}

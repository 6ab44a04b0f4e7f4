use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crawler::task::canonical_domain;
use crate::storage::visits::{VisitCache, VisitCacheError};

#[derive(Debug, Error)]
pub enum PolitenessError {
    #[error("visit cache unavailable: {0}")]
    Cache(#[from] VisitCacheError),
}

/// Rate limiter deciding whether a fetcher host may visit a domain now.
///
/// All state lives in the shared visit cache, so several schedulers can
/// consult the same tracker state concurrently.
#[derive(Clone)]
pub struct PolitenessTracker {
    cache: Arc<dyn VisitCache>,

    /// Minimum seconds between two visits of a domain from one host
    min_interval: i64,

    /// Answer "polite" when the cache cannot be reached
    fail_open: bool,
}

impl PolitenessTracker {
    pub fn new(cache: Arc<dyn VisitCache>, min_interval: i64, fail_open: bool) -> Self {
        Self {
            cache,
            min_interval,
            fail_open,
        }
    }

    /// Whether `fetcher_host` may visit `domain` now
    pub async fn is_polite(&self, domain: &str, fetcher_host: &str) -> Result<bool, PolitenessError> {
        self.is_polite_at(domain, fetcher_host, Utc::now().timestamp()).await
    }

    /// Whether `fetcher_host` may visit `domain` at `now` (unix seconds).
    ///
    /// A host that never visited the domain is always allowed.
    pub async fn is_polite_at(&self, domain: &str, fetcher_host: &str, now: i64) -> Result<bool, PolitenessError> {
        let host = canonical_host(fetcher_host);
        let domain = canonical_domain(domain);

        match self.cache.last_visit(host, domain).await {
            Ok(Some(last_visit)) => {
                let polite = now - last_visit >= self.min_interval;
                debug!("{} -> {} last visited at {}, polite: {}", host, domain, last_visit, polite);
                Ok(polite)
            },
            Ok(None) => Ok(true),
            Err(e) if self.fail_open => {
                warn!("Visit cache unavailable, assuming {} -> {} is polite: {}", host, domain, e);
                Ok(true)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Record that `fetcher_host` visits `domain` at `timestamp`
    pub async fn record_visit(&self, domain: &str, fetcher_host: &str, timestamp: i64) -> Result<(), PolitenessError> {
        let host = canonical_host(fetcher_host);
        let domain = canonical_domain(domain);

        match self.cache.record_visit(host, domain, timestamp).await {
            Ok(()) => Ok(()),
            Err(e) if self.fail_open => {
                warn!("Visit cache unavailable, visit {} -> {} not recorded: {}", host, domain, e);
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// Reduce a fetcher endpoint to its bare host: no scheme, port, or path
pub fn canonical_host(endpoint: &str) -> &str {
    let host = canonical_domain(endpoint);
    let host = host.split('/').next().unwrap_or(host);
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryVisitCache;
    use async_trait::async_trait;

    struct BrokenCache;

    #[async_trait]
    impl VisitCache for BrokenCache {
        async fn last_visit(&self, _host: &str, _domain: &str) -> Result<Option<i64>, VisitCacheError> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }

        async fn record_visit(&self, _host: &str, _domain: &str, _timestamp: i64) -> Result<(), VisitCacheError> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }
    }

    #[tokio::test]
    async fn test_min_interval() {
        let tracker = PolitenessTracker::new(Arc::new(MemoryVisitCache::new()), 30, false);
        let now = 1_000_000;

        // Never visited
        assert!(tracker.is_polite_at("example.com", "10.0.0.1:8081", now).await.unwrap());

        tracker.record_visit("example.com", "10.0.0.1:8081", now - 10).await.unwrap();
        assert!(!tracker.is_polite_at("example.com", "10.0.0.1:8081", now).await.unwrap());

        tracker.record_visit("example.com", "10.0.0.1:8081", now - 40).await.unwrap();
        assert!(tracker.is_polite_at("example.com", "10.0.0.1:8081", now).await.unwrap());

        // Exactly the interval is allowed
        tracker.record_visit("example.com", "10.0.0.1:8081", now - 30).await.unwrap();
        assert!(tracker.is_polite_at("example.com", "10.0.0.1:8081", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_inputs_are_canonicalized() {
        let tracker = PolitenessTracker::new(Arc::new(MemoryVisitCache::new()), 30, false);
        let now = 1_000_000;

        tracker.record_visit("https://example.com", "10.0.0.1:8081", now).await.unwrap();

        // Same host on another port, same domain without scheme
        assert!(!tracker.is_polite_at("example.com", "10.0.0.1:9000", now).await.unwrap());
        assert!(!tracker.is_polite_at("http://example.com", "10.0.0.1", now).await.unwrap());

        // Another host is unaffected
        assert!(tracker.is_polite_at("example.com", "10.0.0.2:8081", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_failure_propagates_by_default() {
        let tracker = PolitenessTracker::new(Arc::new(BrokenCache), 30, false);
        assert!(tracker.is_polite_at("example.com", "10.0.0.1", 0).await.is_err());
        assert!(tracker.record_visit("example.com", "10.0.0.1", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_failure_fail_open() {
        let tracker = PolitenessTracker::new(Arc::new(BrokenCache), 30, true);
        assert!(tracker.is_polite_at("example.com", "10.0.0.1", 0).await.unwrap());
        assert!(tracker.record_visit("example.com", "10.0.0.1", 0).await.is_ok());
    }

    #[test]
    fn test_canonical_host() {
        assert_eq!(canonical_host("10.0.0.1:8081"), "10.0.0.1");
        assert_eq!(canonical_host("fetcher-a"), "fetcher-a");
        assert_eq!(canonical_host("http://127.0.0.1:4000"), "127.0.0.1");
        assert_eq!(canonical_host("http://fetcher-b/push"), "fetcher-b");
    }
}

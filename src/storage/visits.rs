use async_trait::async_trait;
use redis::{Client, aio::ConnectionManager};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use anyhow::Context;

use crate::cli::config::VisitCacheSettings;
use crate::storage::memory::MemoryVisitCache;

/// Errors raised by a visit cache
#[derive(Debug, Error)]
pub enum VisitCacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Shared `host -> domain -> last visit` store.
///
/// Every call must round-trip to the backing store; implementations do not
/// keep a local copy of the timestamps.
#[async_trait]
pub trait VisitCache: Send + Sync {
    /// Last visit of `domain` from `host`, in unix seconds
    async fn last_visit(&self, host: &str, domain: &str) -> Result<Option<i64>, VisitCacheError>;

    /// Record a visit of `domain` from `host`
    async fn record_visit(&self, host: &str, domain: &str, timestamp: i64) -> Result<(), VisitCacheError>;
}

/// Factory for creating a VisitCache implementation
pub struct VisitCacheFactory;

impl VisitCacheFactory {
    /// Create a new VisitCache instance based on the settings
    pub async fn create(settings: &VisitCacheSettings) -> anyhow::Result<Arc<dyn VisitCache>> {
        match settings.storage_type.as_str() {
            "redis" => {
                let cache = RedisVisitCache::new(settings).await?;
                Ok(Arc::new(cache))
            },
            "memory" => {
                warn!("Using in-memory visit cache; politeness is not shared across schedulers");
                Ok(Arc::new(MemoryVisitCache::new()))
            },
            _ => {
                anyhow::bail!("Unsupported visit cache type: {}", settings.storage_type);
            }
        }
    }
}

/// Redis implementation of VisitCache, one hash per fetcher host
pub struct RedisVisitCache {
    /// Reconnecting connection handle, cloned per operation
    conn: ConnectionManager,

    /// Prefix of the per-host hash keys
    key_prefix: String,
}

impl RedisVisitCache {
    /// Connect to the shared visit cache
    pub async fn new(settings: &VisitCacheSettings) -> anyhow::Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = ConnectionManager::new(client).await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn,
            key_prefix: settings.key_prefix.clone(),
        })
    }

    fn host_key(&self, host: &str) -> String {
        format!("{}:{}", self.key_prefix, host)
    }
}

#[async_trait]
impl VisitCache for RedisVisitCache {
    async fn last_visit(&self, host: &str, domain: &str) -> Result<Option<i64>, VisitCacheError> {
        let key = self.host_key(host);
        let mut conn = self.conn.clone();

        let value: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg(domain)
            .query_async(&mut conn)
            .await?;

        match value {
            Some(raw) => match raw.parse::<i64>() {
                Ok(ts) => Ok(Some(ts)),
                Err(e) => {
                    debug!("Ignoring unparsable visit time {} -> {}: {:?} ({})", key, domain, raw, e);
                    Ok(None)
                }
            },
            None => {
                debug!("HGET {} -> {} returned nil", key, domain);
                Ok(None)
            }
        }
    }

    async fn record_visit(&self, host: &str, domain: &str, timestamp: i64) -> Result<(), VisitCacheError> {
        let key = self.host_key(host);
        let mut conn = self.conn.clone();

        let updated: i64 = redis::cmd("HSET")
            .arg(&key)
            .arg(domain)
            .arg(timestamp)
            .query_async(&mut conn)
            .await?;

        debug!("HSET {} {} {} updated: {}", key, domain, timestamp, updated);

        Ok(())
    }
}

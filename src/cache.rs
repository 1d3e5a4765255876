//! Screenshot cache with lazy TTL expiration.
//!
//! The cache is an optimization, not a correctness requirement: read errors
//! degrade to a render and write errors are logged and swallowed by the
//! orchestrator. Keys are the raw validated URL behind a fixed prefix, with
//! no normalization, so `https://a?x=1&y=2` and `https://a?y=2&x=1` are
//! distinct entries. Documented limitation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Derive the cache key for a validated URL.
///
/// Exact string match on the raw URL; the prefix keeps screenshot entries
/// distinguishable in a shared backend.
pub fn cache_key(url: &str) -> String {
    format!("screenshot:{url}")
}

/// Key-value store for rendered PNGs.
///
/// Concurrent `put` calls for the same key may race; last-write-wins is
/// acceptable. Expired entries must never be served.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScreenshotCache: Send + Sync {
    /// Look up a previously rendered image. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, crate::ScreenshotError>;

    /// Store a rendered image with an expiry.
    async fn put(
        &self,
        key: &str,
        image: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), crate::ScreenshotError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    image: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// In-process cache backed by a `DashMap`.
///
/// Expiration is lazy: an entry past its TTL is removed on the `get` that
/// finds it. There is no background sweep; memory for dead entries is
/// reclaimed only when their key is touched again.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, counting expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ScreenshotCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, crate::ScreenshotError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                metrics::increment_counter!("screenshot_cache_hits_total");
                return Ok(Some(entry.image.clone()));
            }
        } else {
            metrics::increment_counter!("screenshot_cache_misses_total");
            return Ok(None);
        }

        // Expired: drop the read guard before removing.
        self.entries.remove(key);
        metrics::increment_counter!("screenshot_cache_misses_total");
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        image: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), crate::ScreenshotError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                image,
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }
}

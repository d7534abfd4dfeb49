//! Bounded in-process cache tier backed by [`moka`].
//!
//! Entries are weighed by their approximate byte footprint and the cache
//! evicts by cost once the budget is reached. Each entry carries its own
//! TTL, applied through moka's per-entry expiration hook.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

use super::{CacheKey, CachedResponse, Tier, TierError};

/// Total cost budget when none is given, in bytes.
const DEFAULT_MAX_BYTES: u64 = 1 << 30;

/// Largest single entry admitted when no limit is given, in bytes.
const DEFAULT_MAX_ENTRY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct Stored {
    response: CachedResponse,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<CacheKey, Stored> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    // An overwrite restarts the clock with the new entry's TTL.
    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// The in-process cache tier.
///
/// Concurrent-safe without external locking; clones share the underlying
/// cache.
#[derive(Clone)]
pub struct MemoryTier {
    cache: Cache<CacheKey, Stored>,
    max_entry_bytes: usize,
}

impl MemoryTier {
    /// Creates a tier with the default budget (1 GiB, 8 MiB per entry).
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRY_BYTES)
    }

    /// Creates a tier bounded by `max_bytes` total and `max_entry_bytes`
    /// for a single entry.
    pub fn with_budget(max_bytes: u64, max_entry_bytes: usize) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &CacheKey, stored: &Stored| {
                (key.as_str().len() + stored.response.weight()).min(u32::MAX as usize) as u32
            })
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            max_entry_bytes,
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tier for MemoryTier {
    async fn fetch(&self, key: &CacheKey) -> Result<Option<CachedResponse>, TierError> {
        Ok(self.cache.get(key).await.map(|stored| stored.response))
    }

    async fn store(&self, key: &CacheKey, response: &CachedResponse, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let weight = response.weight();
        if weight > self.max_entry_bytes {
            debug!(key = %key, weight, "memory tier rejected oversized entry");
            return false;
        }
        self.cache
            .insert(
                key.clone(),
                Stored {
                    response: response.clone(),
                    ttl,
                },
            )
            .await;
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

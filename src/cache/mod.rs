//! Tiered response caching.
//!
//! Two tiers sit behind the [`Tier`] trait: a bounded in-process cache
//! ([`MemoryTier`]) and an optional distributed redis-cluster cache
//! ([`RedisTier`]). The [`CacheService`] owns the policy around them:
//! request eligibility, fingerprinting, lookup with promotion, and
//! distributed-first population.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod entry;
pub mod key;
pub mod memory;
pub mod policy;
pub mod redis;

pub use entry::{CachedResponse, WireError};
pub use key::{CacheKey, HashElements, KeyBuilder, KeyError};
pub use memory::MemoryTier;
pub use policy::{CacheRules, CacheService, Lookup};
pub use redis::RedisTier;

/// Errors a cache tier can surface.
///
/// A plain miss is `Ok(None)` from [`Tier::fetch`], never an error; `Err`
/// means the tier itself failed and the caller should degrade (treat a
/// lookup as a miss, count a failed store) rather than fail the request.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("redis command failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A key/value store for cached responses with per-entry TTL.
///
/// Implementations must be safe for concurrent use without external
/// locking; the orchestrator calls them from many request tasks at once.
#[async_trait]
pub trait Tier: Send + Sync {
    /// Looks up `key`. A miss is `Ok(None)`.
    async fn fetch(&self, key: &CacheKey) -> Result<Option<CachedResponse>, TierError>;

    /// Stores `response` under `key` for `ttl`, best-effort.
    ///
    /// Returns `true` only when the tier accepted the entry. A zero `ttl`
    /// is never stored, and an admission rejection (entry too costly for a
    /// bounded tier) is a normal `false`, not an error.
    async fn store(&self, key: &CacheKey, response: &CachedResponse, ttl: Duration) -> bool;

    /// Short tier name for logs.
    fn name(&self) -> &'static str;
}

//! Distributed cache tier backed by a redis cluster.
//!
//! Values round-trip through the JSON wire encoding of [`CachedResponse`].
//! A key miss is `Ok(None)`; connection and protocol failures surface as
//! [`TierError`] and the policy layer degrades gracefully.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use tracing::warn;

use super::{CacheKey, CachedResponse, Tier, TierError};

/// The distributed cache tier.
///
/// The underlying cluster connection multiplexes commands and is cheap to
/// clone, one clone per in-flight operation.
#[derive(Clone)]
pub struct RedisTier {
    conn: ClusterConnection,
}

impl RedisTier {
    /// Connects to the cluster seeded from `(host, port)` node addresses.
    ///
    /// The connection is established eagerly so a misconfigured cluster
    /// fails at startup instead of on the first request.
    pub async fn connect<I>(nodes: I) -> Result<Self, TierError>
    where
        I: IntoIterator<Item = (String, u16)>,
    {
        let urls: Vec<String> = nodes
            .into_iter()
            .map(|(host, port)| node_url(&host, port))
            .collect();
        let client = ClusterClient::new(urls)?;
        let conn = client.get_async_connection().await?;
        Ok(Self { conn })
    }
}

fn node_url(host: &str, port: u16) -> String {
    format!("redis://{host}:{port}")
}

#[async_trait]
impl Tier for RedisTier {
    async fn fetch(&self, key: &CacheKey) -> Result<Option<CachedResponse>, TierError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key.as_str()).await?;
        match value {
            Some(bytes) => Ok(Some(CachedResponse::from_wire(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &CacheKey, response: &CachedResponse, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let wire = match response.to_wire() {
            Ok(wire) => wire,
            Err(err) => {
                warn!(key = %key, error = %err, "cached response encode failed");
                return false;
            }
        };
        let mut conn = self.conn.clone();
        match conn
            .set_ex::<_, _, ()>(key.as_str(), wire, ttl.as_secs())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %key, error = %err, "redis store failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_urls() {
        assert_eq!(node_url("127.0.0.1", 7000), "redis://127.0.0.1:7000");
        assert_eq!(node_url("cache.internal", 6379), "redis://cache.internal:6379");
    }
}

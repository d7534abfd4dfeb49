//! Request orchestration: policy, cache, forward, populate.
//!
//! [`Gateway::handle`] is the terminal handler of the pipeline. Every
//! request leaves it down exactly one of three paths, and the chosen path
//! is stamped onto the response so clients, logs and metrics all see the
//! same story:
//!
//! 1. **skipped** — caching bypassed by policy; pure pass-through.
//! 2. **hit** — replayed from cache; the upstream is never contacted.
//! 3. **miss** — forwarded, and the captured response is handed to a
//!    detached task for cache population.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::cache::{CacheKey, CacheService, CachedResponse};
use crate::context::Context;
use crate::http::{Response, StatusCode};
use crate::metrics::Metrics;
use crate::proxy::{Forwarder, ProxyError};

/// Response header carrying the cache outcome.
pub const OUTCOME_HEADER: &str = "X-Larder";

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Hit,
    Miss,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Skipped => "skipped",
            Outcome::Hit => "hit",
            Outcome::Miss => "miss",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request orchestrator.
pub struct Gateway {
    cache: Arc<CacheService>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(
        cache: Arc<CacheService>,
        forwarder: Arc<Forwarder>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            forwarder,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Resolves one request to one response. Never fails: upstream errors
    /// become a 502 with a JSON body, cache trouble degrades to plain
    /// forwarding.
    pub async fn handle(&self, ctx: Context) -> Response {
        let peer = ctx.peer_addr();
        let req = ctx.request();

        if self.cache.skip(req) {
            self.metrics.record_skipped();
            let response = match self.forwarder.forward(req, peer, false).await {
                Ok(reply) => reply.response,
                Err(err) => self.bad_gateway(err),
            };
            return annotate(response, Outcome::Skipped);
        }

        let found = self.cache.lookup(req).await;
        if let Some(cached) = found.response {
            self.metrics.record_hit();
            debug!(target = req.target(), "replaying cached response");
            return annotate(replay(&cached), Outcome::Hit);
        }

        self.metrics.record_miss();
        let capture = found.key.is_some();
        let response = match self.forwarder.forward(req, peer, capture).await {
            Ok(reply) => {
                if let (Some(key), Some(captured)) = (found.key, reply.captured) {
                    if self.cache.will_store(captured.status()) {
                        self.store_detached(key, captured);
                    }
                }
                reply.response
            }
            Err(err) => self.bad_gateway(err),
        };
        annotate(response, Outcome::Miss)
    }

    /// Hands the captured response to a detached task. The client response
    /// is already on its way out; a failed store costs a log line and a
    /// counter bump, nothing more.
    fn store_detached(&self, key: CacheKey, response: CachedResponse) {
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            if !cache.store(&key, &response).await {
                metrics.record_store_failure();
                warn!(key = %key, "captured response was not stored");
            }
        });
    }

    fn bad_gateway(&self, err: ProxyError) -> Response {
        self.metrics.record_upstream_error();
        error!(error = %err, "upstream exchange failed");
        let body = serde_json::json!({ "message": err.to_string() }).to_string();
        Response::new(StatusCode::BadGateway)
            .header("Content-Type", "application/json")
            .body(body)
    }
}

fn replay(cached: &CachedResponse) -> Response {
    Response::from_parts(
        cached.status(),
        cached.headers().clone(),
        cached.body().to_vec(),
    )
}

fn annotate(mut response: Response, outcome: Outcome) -> Response {
    response.set_header(OUTCOME_HEADER, outcome.as_str());
    response
}

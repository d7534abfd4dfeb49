//! Upstream forwarding.
//!
//! The [`Forwarder`] relays a client request to one of a fixed pool of
//! upstreams, selected by a shared round-robin counter, and can capture a
//! copy of the response for the cache. When no capture is requested the
//! exchange is a pure pass-through.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::CachedResponse;
use crate::http::{Headers, Request, Response};

mod exchange;

/// Connection-scoped header names that must not travel past one hop,
/// per RFC 9110 §7.6.1. Framing headers are listed too since both sides
/// of the proxy regenerate them.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// One upstream address in the rotation pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors produced while forwarding a request.
///
/// All of them terminate the attempt; there is no in-request retry or
/// failover, the rotation simply advances on the next request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no upstreams configured")]
    NoUpstreams,

    #[error("upstream {authority} unreachable: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {authority} io failure: {source}")]
    Io {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {authority} sent an invalid response: {reason}")]
    InvalidResponse { authority: String, reason: String },
}

/// The outcome of a successful forward.
pub struct ProxyReply {
    /// The response to relay to the client.
    pub response: Response,
    /// A cacheable copy of the same response, present only when capture
    /// was requested.
    pub captured: Option<CachedResponse>,
}

/// Forwards requests round-robin over a static upstream pool.
///
/// The pool is fixed at construction; the rotation counter is the only
/// state and is shared by all clones of the surrounding `Arc`.
pub struct Forwarder {
    upstreams: Vec<Upstream>,
    cursor: AtomicUsize,
}

impl Forwarder {
    /// Builds a forwarder over `upstreams`.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NoUpstreams`] when the pool is empty.
    pub fn new(upstreams: Vec<Upstream>) -> Result<Self, ProxyError> {
        if upstreams.is_empty() {
            return Err(ProxyError::NoUpstreams);
        }
        Ok(Self {
            upstreams,
            cursor: AtomicUsize::new(0),
        })
    }

    fn next_upstream(&self) -> &Upstream {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.upstreams.len();
        &self.upstreams[idx]
    }

    /// Relays `req` to the next upstream in rotation.
    ///
    /// Standard proxy headers are injected on the way out: `Host` is
    /// rewritten to the upstream authority, the peer address is appended
    /// to `X-Forwarded-For`, and the original host travels in
    /// `X-Forwarded-Host`. With `capture` set, the full response is also
    /// copied into a [`CachedResponse`] after hop-by-hop headers are
    /// stripped; the client-visible response is identical either way.
    pub async fn forward(
        &self,
        req: &Request,
        peer: Option<SocketAddr>,
        capture: bool,
    ) -> Result<ProxyReply, ProxyError> {
        let upstream = self.next_upstream();
        debug!(upstream = %upstream, method = %req.method(), target = req.target(), "forwarding");

        let outbound = outbound_headers(req, upstream, peer);
        let parts = exchange::send(&upstream.authority(), req, outbound).await?;

        let headers = end_to_end_headers(&parts.headers);
        let captured = capture.then(|| {
            CachedResponse::new(parts.status, headers.clone(), parts.body.clone())
        });
        let response = Response::from_parts(parts.status, headers, parts.body.to_vec());

        Ok(ProxyReply { response, captured })
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Builds the outbound header set: the client's end-to-end headers plus
/// the standard proxy headers.
fn outbound_headers(req: &Request, upstream: &Upstream, peer: Option<SocketAddr>) -> Headers {
    let mut headers = Headers::with_capacity(req.headers().len() + 4);
    for (name, value) in req.headers().iter() {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        headers.insert(name, value);
    }

    headers.set("Host", upstream.authority());
    if let Some(peer) = peer {
        let ip = peer.ip().to_string();
        match req.headers().get("x-forwarded-for") {
            Some(existing) if !existing.is_empty() => {
                headers.set("X-Forwarded-For", format!("{existing}, {ip}"));
            }
            _ => headers.set("X-Forwarded-For", ip),
        }
    }
    if !req.host().is_empty() {
        headers.set("X-Forwarded-Host", req.host());
    }
    headers.set("X-Forwarded-Proto", "http");
    headers
}

/// Drops hop-by-hop headers from an upstream response, keeping order.
fn end_to_end_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect()
}

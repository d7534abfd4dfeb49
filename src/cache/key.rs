//! Request fingerprinting.
//!
//! Every cacheable request is reduced to a deterministic key: a SHA-256
//! digest over the method, host, and a configurable selection of path,
//! query parameters and headers. Two requests that agree on every selected
//! element share a key; elements outside the selection never influence it.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::http::request::parse_query_string;
use crate::http::{Headers, Request, canonical_name};

/// Errors produced while computing a fingerprint.
///
/// Recoverable by design: a request whose key cannot be computed is simply
/// not cacheable, and must still be proxied.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("forwarded target {value:?} is not an absolute path")]
    MalformedOverride { value: String },
}

/// Which parts of a request participate in its fingerprint.
///
/// An empty `headers` or `query_params` list selects *all* names present on
/// the request, in sorted order, so that arrival order cannot perturb the
/// key. A non-empty list is applied in its own order; names absent from the
/// request are skipped silently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HashElements {
    pub use_path: bool,
    pub headers: Vec<String>,
    pub query_params: Vec<String>,
}

impl HashElements {
    /// Rewrites the configured header names into canonical form.
    ///
    /// Done once at configuration load so that per-request lookups compare
    /// like against like regardless of how the operator spelled the names.
    pub fn canonicalize(&mut self) {
        for name in &mut self.headers {
            *name = canonical_name(name);
        }
    }
}

/// An opaque cache key.
///
/// Format: `{prefix}-<hex sha256>-`. The braces are literal; redis cluster
/// treats a braced substring as the hash tag, which pins all keys of one
/// deployment to the same slot set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Computes cache keys for requests.
///
/// Holds the composed key prefix and the ordered list of forwarding-header
/// names. When a request carries one of those headers (first non-empty
/// wins), its value replaces the request's own path and query for
/// fingerprinting purposes, so a rewriting front proxy and a direct client
/// produce the same key for the same logical resource.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
    forwarding_headers: Vec<String>,
}

struct ForwardedTarget {
    path: String,
    params: HashMap<String, String>,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>, forwarding_headers: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            forwarding_headers,
        }
    }

    /// Computes the fingerprint of `req` under the given element selection.
    ///
    /// # Errors
    ///
    /// [`KeyError::MalformedOverride`] when a forwarding header is present
    /// but its value does not start with `/`.
    pub fn compute(&self, req: &Request, elements: &HashElements) -> Result<CacheKey, KeyError> {
        let forwarded = self.forwarded_target(req)?;
        let (path, params) = match &forwarded {
            Some(target) => (target.path.as_str(), &target.params),
            None => (req.path(), req.query_map()),
        };

        let mut hasher = Sha256::new();
        hasher.update(req.method().as_str().as_bytes());
        hasher.update(req.host().as_bytes());
        if elements.use_path {
            hasher.update(path.as_bytes());
        }
        digest_params(&mut hasher, params, &elements.query_params);
        digest_headers(&mut hasher, req.headers(), &elements.headers);

        Ok(CacheKey(format!(
            "{{{}}}-{:x}-",
            self.prefix,
            hasher.finalize()
        )))
    }

    fn forwarded_target(&self, req: &Request) -> Result<Option<ForwardedTarget>, KeyError> {
        for name in &self.forwarding_headers {
            match req.headers().get(name) {
                Some(value) if !value.is_empty() => return parse_target(value).map(Some),
                _ => {}
            }
        }
        Ok(None)
    }
}

fn parse_target(value: &str) -> Result<ForwardedTarget, KeyError> {
    if !value.starts_with('/') {
        return Err(KeyError::MalformedOverride {
            value: value.to_owned(),
        });
    }
    let (path, params) = match value.find('?') {
        Some(pos) => (
            value[..pos].to_owned(),
            parse_query_string(&value[pos + 1..]),
        ),
        None => (value.to_owned(), HashMap::new()),
    };
    Ok(ForwardedTarget { path, params })
}

fn digest_params(hasher: &mut Sha256, params: &HashMap<String, String>, selection: &[String]) {
    let sorted;
    let names: &[String] = if selection.is_empty() {
        let mut all: Vec<String> = params.keys().cloned().collect();
        all.sort_unstable();
        sorted = all;
        &sorted
    } else {
        selection
    };
    for name in names {
        if let Some(value) = params.get(name) {
            hasher.update(format!("{name}={value}").as_bytes());
        }
    }
}

fn digest_headers(hasher: &mut Sha256, headers: &Headers, selection: &[String]) {
    let sorted;
    let names: &[String] = if selection.is_empty() {
        let mut all: Vec<String> = headers
            .iter()
            .map(|(name, _)| canonical_name(name))
            .collect();
        all.sort_unstable();
        all.dedup();
        sorted = all;
        &sorted
    } else {
        selection
    };
    for name in names {
        // First value wins for repeated names; lookup is case-insensitive.
        if let Some(value) = headers.get(name) {
            hasher.update(format!("{name}={value}").as_bytes());
        }
    }
}

//! The cached response value object and its wire encoding.
//!
//! Both cache tiers store the same value: the status, headers and body of a
//! captured upstream response. The distributed tier additionally needs a
//! byte-level encoding; JSON with a base64 body is used so that repeated
//! header names, header order and binary bodies all survive a round trip.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{Headers, StatusCode};

/// Errors produced while encoding or decoding a cached response for the
/// distributed tier.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("cached response encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("cached response decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cached response body is not valid base64: {0}")]
    Body(#[from] base64::DecodeError),
}

/// A captured upstream response, immutable once stored.
///
/// Hop-by-hop and framing headers are stripped at capture time, so an entry
/// holds exactly what a later replay should send: end-to-end headers in
/// their original order plus the body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers,
            body,
        }
    }

    /// Returns the response status.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status)
    }

    /// Returns the stored end-to-end headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the stored body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Approximate in-memory footprint, used for cost accounting by the
    /// bounded in-process tier.
    pub fn weight(&self) -> usize {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len() + 4)
            .sum();
        self.body.len() + header_bytes + 64
    }

    /// Encodes the response into its wire form for the distributed tier.
    pub fn to_wire(&self) -> Result<Vec<u8>, WireError> {
        let wire = Wire {
            status: self.status,
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: BASE64.encode(&self.body),
        };
        serde_json::to_vec(&wire).map_err(WireError::Encode)
    }

    /// Decodes a response from its wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        let wire: Wire = serde_json::from_slice(bytes).map_err(WireError::Decode)?;
        let body = BASE64.decode(&wire.body)?;
        Ok(Self {
            status: wire.status,
            headers: wire.headers.into_iter().collect(),
            body: Bytes::from(body),
        })
    }
}

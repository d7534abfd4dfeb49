//! # larder
//!
//! An async HTTP/1.1 caching reverse proxy written in Rust.
//!
//! larder sits in front of one or more upstream servers, fingerprints each
//! cacheable request into a deterministic key, and answers repeat requests
//! from an in-memory tier backed by an optional Redis cluster tier. Every
//! response is annotated with an `X-Larder` header (`hit`, `miss`, or
//! `skipped`) so callers and downstream tooling can see what the proxy did.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use larder::server::Server;
//! use larder::http::{Request, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(|_req: Request, _peer| async {
//!         Response::new(StatusCode::Ok).body("Hello, World!")
//!     }).await?;
//!     Ok(())
//! }
//! ```
//!
//! The binary wires the full pipeline instead: configuration is loaded from
//! `config.yaml`, requests flow through the middleware chain into the
//! [`router`], and the catch-all route hands them to the [`gateway`], which
//! consults the [`cache`] before forwarding via the [`proxy`].

pub mod cache;
pub mod config;
pub mod context;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};

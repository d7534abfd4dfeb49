//! Full-pipeline tests over real sockets.
//!
//! Each test boots the same wiring the binary uses — config file, cache
//! service, forwarder, gateway, router, middleware chain, server — against
//! a local upstream stub, then talks to it with a raw TCP client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use larder::cache::{CacheService, MemoryTier, Tier};
use larder::config::Config;
use larder::context::{ClientAddr, Context};
use larder::gateway::Gateway;
use larder::metrics::Metrics;
use larder::middleware::{MiddlewareHandler, Next, RequestLogger, from_middleware};
use larder::proxy::Forwarder;
use larder::{Request, Response, Router, Server, StatusCode};

/// An upstream stub that numbers every request it serves, so the body of a
/// replayed response is visibly stale: `/broken` answers 500, everything
/// else 200 with `served <n>`.
async fn spawn_upstream() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&served);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let count = Arc::clone(&count);
            tokio::spawn(async move {
                let mut chunk = vec![0u8; 16 * 1024];
                let mut seen = Vec::new();
                let req = loop {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            seen.extend_from_slice(&chunk[..n]);
                            if let Ok((req, offset)) = Request::parse(&seen) {
                                if seen.len() - offset >= req.content_length().unwrap_or(0) {
                                    break req;
                                }
                            }
                        }
                    }
                };
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                let forwarded = req
                    .headers()
                    .get("x-forwarded-for")
                    .unwrap_or("-")
                    .to_owned();
                let (status_line, body) = if req.path() == "/broken" {
                    ("HTTP/1.1 500 Internal Server Error", format!("boom {n}"))
                } else {
                    ("HTTP/1.1 200 OK", format!("served {n}"))
                };
                let reply = format!(
                    "{status_line}\r\nContent-Type: text/plain\r\nX-Seen-Forwarded-For: {forwarded}\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    (port, served)
}

fn write_config(upstream_port: u16) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "larder-e2e-{}-{}.yaml",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    let yaml = format!(
        r#"
services:
  cache:
    exceptions:
      - "/admin"
    methods: ["GET"]
    ttl:
      success: 60
      error: 0
    hash:
      prefix: e2e
      usePath: true
  proxy:
    upstreams:
      - host: "127.0.0.1"
        port: {upstream_port}
"#
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

struct Proxy {
    addr: SocketAddr,
    cache: Arc<CacheService>,
}

/// Boots the full pipeline against `upstream_port` and returns the
/// listening address plus a handle on the cache service for polling.
async fn boot(upstream_port: u16) -> Proxy {
    let config = Config::from_file(&write_config(upstream_port)).unwrap();

    let memory: Arc<dyn Tier> = Arc::new(MemoryTier::new());
    let cache = Arc::new(CacheService::new(config.cache_rules(), memory, None));
    let forwarder = Arc::new(Forwarder::new(config.services.proxy.upstreams.clone()).unwrap());
    let metrics = Arc::new(Metrics::new());
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&cache),
        forwarder,
        Arc::clone(&metrics),
    ));

    let mut router = Router::new();
    router.get("/larder/healthz", |_ctx| async {
        Response::new(StatusCode::NoContent)
    });
    router.get("/larder/metrics", move |_ctx| {
        let metrics = Arc::clone(&metrics);
        async move {
            Response::new(StatusCode::Ok)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(metrics.render())
        }
    });
    router.any("/*", move |ctx| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle(ctx).await }
    });
    let router = Arc::new(router);

    let terminal: MiddlewareHandler = Arc::new(move |ctx: Context, _next: Next| {
        let router = Arc::clone(&router);
        Box::pin(async move { router.route(ctx).await })
    });
    let chain: Vec<MiddlewareHandler> = vec![from_middleware(Arc::new(RequestLogger)), terminal];

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server
            .run(move |request, peer| {
                let chain = chain.clone();
                async move {
                    let mut ctx = Context::new(request);
                    ctx.extensions_mut().insert(ClientAddr(peer));
                    Next::new(chain).run(ctx).await
                }
            })
            .await;
    });
    Proxy { addr, cache }
}

/// One raw HTTP exchange; the request must carry `Connection: close`.
async fn send(addr: SocketAddr, raw: &str) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    parse_response(&buf)
}

fn parse_response(raw: &[u8]) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = std::str::from_utf8(&raw[..split]).unwrap();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .expect("bad status line");
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_owned()))
        .collect();
    (status, headers, body)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == &name.to_ascii_lowercase())
        .map(|(_, v)| v.as_str())
}

fn get(target: &str) -> String {
    format!("GET {target} HTTP/1.1\r\nHost: larder.test\r\nConnection: close\r\n\r\n")
}

fn post(target: &str) -> String {
    format!(
        "POST {target} HTTP/1.1\r\nHost: larder.test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

/// Cache population is detached from the response path, so tests poll
/// until the entry lands.
async fn eventually_cached(cache: &CacheService, raw: &str) {
    let (req, _) = Request::parse(raw.as_bytes()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if cache.lookup(&req).await.response.is_some() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "entry never appeared in the cache"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn miss_then_hit_without_a_second_upstream_call() {
    let (port, served) = spawn_upstream().await;
    let proxy = boot(port).await;

    let (status, headers, body) = send(proxy.addr, &get("/products")).await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "x-larder"), Some("miss"));
    assert_eq!(body, b"served 1");

    eventually_cached(&proxy.cache, &get("/products")).await;

    let (status, headers, body) = send(proxy.addr, &get("/products")).await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "x-larder"), Some("hit"));
    // The replayed body is the first response, verbatim.
    assert_eq!(body, b"served 1");
    assert_eq!(served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_is_skipped_every_time() {
    let (port, served) = spawn_upstream().await;
    let proxy = boot(port).await;

    for expected in [b"served 1", b"served 2"] {
        let (status, headers, body) = send(proxy.addr, &post("/products")).await;
        assert_eq!(status, 200);
        assert_eq!(header(&headers, "x-larder"), Some("skipped"));
        assert_eq!(body, expected);
    }
    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn excepted_target_is_never_cached() {
    let (port, served) = spawn_upstream().await;
    let proxy = boot(port).await;

    for _ in 0..2 {
        let (_, headers, _) = send(proxy.addr, &get("/admin")).await;
        assert_eq!(header(&headers, "x-larder"), Some("skipped"));
    }
    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn zero_error_ttl_keeps_failures_out_of_the_cache() {
    let (port, served) = spawn_upstream().await;
    let proxy = boot(port).await;

    for n in 1..=2 {
        let (status, headers, body) = send(proxy.addr, &get("/broken")).await;
        assert_eq!(status, 500);
        assert_eq!(header(&headers, "x-larder"), Some("miss"));
        assert_eq!(body, format!("boom {n}").as_bytes());
    }
    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dead_upstream_becomes_a_json_502() {
    // Port 1 refuses connections.
    let proxy = boot(1).await;

    let (status, headers, body) = send(proxy.addr, &get("/anything")).await;
    assert_eq!(status, 502);
    assert_eq!(header(&headers, "content-type"), Some("application/json"));
    assert_eq!(header(&headers, "x-larder"), Some("miss"));
    let message: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(message["message"].as_str().unwrap().contains("unreachable"));
}

#[tokio::test]
async fn healthz_answers_without_the_upstream() {
    let (port, served) = spawn_upstream().await;
    let proxy = boot(port).await;

    let (status, _, body) = send(proxy.addr, &get("/larder/healthz")).await;
    assert_eq!(status, 204);
    assert!(body.is_empty());
    assert_eq!(served.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn metrics_reflect_the_traffic() {
    let (port, _served) = spawn_upstream().await;
    let proxy = boot(port).await;

    send(proxy.addr, &get("/data")).await; // miss
    eventually_cached(&proxy.cache, &get("/data")).await;
    send(proxy.addr, &get("/data")).await; // hit
    send(proxy.addr, &post("/data")).await; // skipped

    let (status, headers, body) = send(proxy.addr, &get("/larder/metrics")).await;
    assert_eq!(status, 200);
    assert_eq!(
        header(&headers, "content-type"),
        Some("text/plain; version=0.0.4")
    );
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("larder_requests_total{outcome=\"hit\"} 1\n"));
    assert!(text.contains("larder_requests_total{outcome=\"miss\"} 1\n"));
    assert!(text.contains("larder_requests_total{outcome=\"skipped\"} 1\n"));
}

#[tokio::test]
async fn client_address_reaches_the_upstream() {
    let (port, _served) = spawn_upstream().await;
    let proxy = boot(port).await;

    let (_, headers, _) = send(proxy.addr, &post("/whoami")).await;
    // The stub echoes the X-Forwarded-For it received.
    assert_eq!(header(&headers, "x-seen-forwarded-for"), Some("127.0.0.1"));
}

//! Cache policy: eligibility, tiered lookup and population.
//!
//! [`CacheService`] is the one place that knows the caching rules. It owns
//! both tiers behind the [`Tier`] trait and never names a concrete
//! implementation, so the distributed tier can be absent entirely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::http::{Method, Request, StatusCode};

use super::{CacheKey, CachedResponse, HashElements, KeyBuilder, Tier};

/// Everything the policy engine needs to know, fixed at construction.
///
/// Built from the validated configuration; the prefix arrives already
/// composed with the deployment environment.
#[derive(Debug, Clone)]
pub struct CacheRules {
    pub prefix: String,
    pub elements: HashElements,
    pub overrides: HashMap<String, HashElements>,
    pub forwarding_headers: Vec<String>,
    pub methods: Vec<Method>,
    pub exceptions: Vec<String>,
    pub ttl_success: Duration,
    pub ttl_error: Duration,
}

/// The result of a cache lookup.
///
/// `key` is present whenever a fingerprint could be computed, even when the
/// tiers had nothing (or failed), so the caller can populate the cache from
/// the proxied response later.
#[derive(Debug)]
pub struct Lookup {
    pub key: Option<CacheKey>,
    pub response: Option<CachedResponse>,
}

impl Lookup {
    fn uncacheable() -> Self {
        Self {
            key: None,
            response: None,
        }
    }
}

/// The cache policy engine.
pub struct CacheService {
    keys: KeyBuilder,
    elements: HashElements,
    overrides: HashMap<String, HashElements>,
    methods: Vec<Method>,
    exceptions: Vec<String>,
    ttl_success: Duration,
    ttl_error: Duration,
    memory: Arc<dyn Tier>,
    distributed: Option<Arc<dyn Tier>>,
}

impl CacheService {
    /// Builds the engine from its rules and tier instances.
    ///
    /// Selected header names in the global elements and every override are
    /// canonicalized here, once, so request-time lookups and digests always
    /// see the same spelling.
    pub fn new(
        rules: CacheRules,
        memory: Arc<dyn Tier>,
        distributed: Option<Arc<dyn Tier>>,
    ) -> Self {
        let mut elements = rules.elements;
        elements.canonicalize();
        let overrides = rules
            .overrides
            .into_iter()
            .map(|(path, mut elements)| {
                elements.canonicalize();
                (path, elements)
            })
            .collect();
        Self {
            keys: KeyBuilder::new(rules.prefix, rules.forwarding_headers),
            elements,
            overrides,
            methods: rules.methods,
            exceptions: rules.exceptions,
            ttl_success: rules.ttl_success,
            ttl_error: rules.ttl_error,
            memory,
            distributed,
        }
    }

    /// Decides whether caching should be bypassed for this request.
    ///
    /// A request is eligible only when its method is in the configured set
    /// and its target (path plus query, exactly as sent) is not listed as
    /// an exception. An empty method set therefore skips everything.
    pub fn skip(&self, req: &Request) -> bool {
        let cacheable_method = self.methods.contains(req.method());
        let excepted = self.exceptions.iter().any(|e| e == req.target());
        !(cacheable_method && !excepted)
    }

    /// Computes the request's fingerprint and consults the tiers in order:
    /// in-process first, then distributed. A distributed hit is promoted
    /// into the in-process tier under the same TTL rule before returning.
    ///
    /// Failures never propagate: a fingerprint error yields an uncacheable
    /// lookup, a tier error degrades to a miss, both under a warn log.
    pub async fn lookup(&self, req: &Request) -> Lookup {
        let elements = self.overrides.get(req.path()).unwrap_or(&self.elements);
        let key = match self.keys.compute(req, elements) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "fingerprint unavailable, request not cacheable");
                return Lookup::uncacheable();
            }
        };

        match self.memory.fetch(&key).await {
            Ok(Some(response)) => {
                debug!(key = %key, tier = self.memory.name(), "cache hit");
                return Lookup {
                    key: Some(key),
                    response: Some(response),
                };
            }
            Ok(None) => {}
            Err(err) => {
                warn!(key = %key, tier = self.memory.name(), error = %err, "cache fetch failed");
            }
        }

        let Some(distributed) = &self.distributed else {
            return Lookup {
                key: Some(key),
                response: None,
            };
        };

        match distributed.fetch(&key).await {
            Ok(Some(response)) => {
                debug!(key = %key, tier = distributed.name(), "cache hit");
                let ttl = self.ttl_for(response.status());
                self.memory.store(&key, &response, ttl).await;
                Lookup {
                    key: Some(key),
                    response: Some(response),
                }
            }
            Ok(None) => Lookup {
                key: Some(key),
                response: None,
            },
            Err(err) => {
                warn!(key = %key, tier = distributed.name(), error = %err, "cache fetch failed");
                Lookup {
                    key: Some(key),
                    response: None,
                }
            }
        }
    }

    /// Stores a captured response under `key` in both tiers, best-effort.
    ///
    /// The TTL follows the response status (error statuses use the error
    /// TTL); a zero TTL returns `false` without touching either tier. The
    /// distributed tier is written first, and the in-process tier only when
    /// that write succeeded, so the local tier never holds an entry the
    /// distributed tier rejected.
    pub async fn store(&self, key: &CacheKey, response: &CachedResponse) -> bool {
        let ttl = self.ttl_for(response.status());
        if ttl.is_zero() {
            return false;
        }
        if let Some(distributed) = &self.distributed {
            if !distributed.store(key, response, ttl).await {
                warn!(key = %key, tier = distributed.name(), "cache store refused");
                return false;
            }
        }
        self.memory.store(key, response, ttl).await
    }

    /// Whether the TTL policy would store a response with this status at
    /// all. Lets callers avoid capturing or dispatching a store that
    /// [`store`](Self::store) would refuse anyway.
    pub fn will_store(&self, status: StatusCode) -> bool {
        !self.ttl_for(status).is_zero()
    }

    fn ttl_for(&self, status: StatusCode) -> Duration {
        if status.is_error() {
            self.ttl_error
        } else {
            self.ttl_success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TierError;
    use crate::http::Headers;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTier {
        entries: Mutex<HashMap<String, CachedResponse>>,
        fetch_calls: AtomicUsize,
        store_calls: AtomicUsize,
        last_ttl: Mutex<Option<Duration>>,
        fail_fetch: AtomicBool,
        reject_store: bool,
    }

    impl FakeTier {
        fn rejecting() -> Self {
            Self {
                reject_store: true,
                ..Default::default()
            }
        }

        fn seed(&self, key: &CacheKey, response: CachedResponse) {
            self.entries
                .lock()
                .unwrap()
                .insert(key.as_str().to_owned(), response);
        }

        fn disable(&self) {
            self.fail_fetch.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Tier for FakeTier {
        async fn fetch(&self, key: &CacheKey) -> Result<Option<CachedResponse>, TierError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(TierError::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "tier offline",
                ))));
            }
            Ok(self.entries.lock().unwrap().get(key.as_str()).cloned())
        }

        async fn store(&self, key: &CacheKey, response: &CachedResponse, ttl: Duration) -> bool {
            self.store_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_ttl.lock().unwrap() = Some(ttl);
            if self.reject_store || ttl.is_zero() {
                return false;
            }
            self.seed(key, response.clone());
            true
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn make_request(method: &str, target: &str, headers: &[(&str, &str)]) -> Request {
        let mut raw = format!("{method} {target} HTTP/1.1\r\nHost: cache.test\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn rules() -> CacheRules {
        CacheRules {
            prefix: "test".to_owned(),
            elements: HashElements {
                use_path: true,
                ..Default::default()
            },
            overrides: HashMap::new(),
            forwarding_headers: vec!["X-Forwarded-Uri".to_owned()],
            methods: vec![Method::Get],
            exceptions: vec!["/health".to_owned()],
            ttl_success: Duration::from_secs(60),
            ttl_error: Duration::from_secs(5),
        }
    }

    fn entry(status: u16, body: &[u8]) -> CachedResponse {
        CachedResponse::new(
            StatusCode::from_u16(status),
            Headers::new(),
            Bytes::copy_from_slice(body),
        )
    }

    #[test]
    fn skip_matrix() {
        let mem = Arc::new(FakeTier::default());
        let svc = CacheService::new(rules(), mem, None);

        assert!(!svc.skip(&make_request("GET", "/things", &[])));
        assert!(svc.skip(&make_request("POST", "/things", &[])));
        assert!(svc.skip(&make_request("DELETE", "/things", &[])));
        assert!(svc.skip(&make_request("GET", "/health", &[])));
        // The exception list matches the exact target, query included.
        assert!(!svc.skip(&make_request("GET", "/health?verbose=1", &[])));
    }

    #[test]
    fn empty_method_set_skips_everything() {
        let mut r = rules();
        r.methods.clear();
        let svc = CacheService::new(r, Arc::new(FakeTier::default()), None);
        assert!(svc.skip(&make_request("GET", "/things", &[])));
        assert!(svc.skip(&make_request("POST", "/things", &[])));
    }

    #[test]
    fn exception_target_matches_as_sent() {
        let mut r = rules();
        r.exceptions = vec!["/items?page=1".to_owned()];
        let svc = CacheService::new(r, Arc::new(FakeTier::default()), None);
        assert!(svc.skip(&make_request("GET", "/items?page=1", &[])));
        assert!(!svc.skip(&make_request("GET", "/items?page=2", &[])));
        assert!(!svc.skip(&make_request("GET", "/items", &[])));
    }

    #[tokio::test]
    async fn lookup_miss_then_store_then_hit() {
        let mem = Arc::new(FakeTier::default());
        let svc = CacheService::new(rules(), mem.clone(), None);
        let req = make_request("GET", "/things", &[]);

        let miss = svc.lookup(&req).await;
        let key = miss.key.expect("fingerprint should be available");
        assert!(miss.response.is_none());

        assert!(svc.store(&key, &entry(200, b"payload")).await);
        assert_eq!(*mem.last_ttl.lock().unwrap(), Some(Duration::from_secs(60)));

        let hit = svc.lookup(&req).await;
        assert_eq!(hit.key.as_ref(), Some(&key));
        assert_eq!(hit.response, Some(entry(200, b"payload")));
    }

    #[tokio::test]
    async fn error_status_uses_error_ttl() {
        let mem = Arc::new(FakeTier::default());
        let svc = CacheService::new(rules(), mem.clone(), None);
        let req = make_request("GET", "/things", &[]);
        let key = svc.lookup(&req).await.key.unwrap();

        assert!(svc.store(&key, &entry(404, b"nope")).await);
        assert_eq!(*mem.last_ttl.lock().unwrap(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn zero_ttl_touches_neither_tier() {
        let mem = Arc::new(FakeTier::default());
        let dist = Arc::new(FakeTier::default());
        let mut r = rules();
        r.ttl_error = Duration::ZERO;
        let svc = CacheService::new(r, mem.clone(), Some(dist.clone()));
        let req = make_request("GET", "/things", &[]);
        let key = svc.lookup(&req).await.key.unwrap();

        assert!(!svc.store(&key, &entry(500, b"boom")).await);
        assert_eq!(mem.store_calls.load(Ordering::SeqCst), 0);
        assert_eq!(dist.store_calls.load(Ordering::SeqCst), 0);

        assert!(!svc.will_store(StatusCode::from_u16(500)));
        assert!(svc.will_store(StatusCode::from_u16(200)));
    }

    #[tokio::test]
    async fn memory_never_holds_what_distributed_rejected() {
        let mem = Arc::new(FakeTier::default());
        let dist = Arc::new(FakeTier::rejecting());
        let svc = CacheService::new(rules(), mem.clone(), Some(dist.clone()));
        let req = make_request("GET", "/things", &[]);
        let key = svc.lookup(&req).await.key.unwrap();

        assert!(!svc.store(&key, &entry(200, b"data")).await);
        assert_eq!(dist.store_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mem.store_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn distributed_hit_is_promoted_and_survives_outage() {
        let mem = Arc::new(FakeTier::default());
        let dist = Arc::new(FakeTier::default());
        let svc = CacheService::new(rules(), mem.clone(), Some(dist.clone()));
        let req = make_request("GET", "/things", &[]);

        let key = svc.lookup(&req).await.key.unwrap();
        dist.seed(&key, entry(200, b"from afar"));

        let hit = svc.lookup(&req).await;
        assert_eq!(hit.response, Some(entry(200, b"from afar")));
        // Promotion wrote the local tier with the success TTL.
        assert_eq!(mem.store_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*mem.last_ttl.lock().unwrap(), Some(Duration::from_secs(60)));

        let dist_fetches = dist.fetch_calls.load(Ordering::SeqCst);
        dist.disable();

        let local = svc.lookup(&req).await;
        assert_eq!(local.response, Some(entry(200, b"from afar")));
        assert_eq!(dist.fetch_calls.load(Ordering::SeqCst), dist_fetches);
    }

    #[tokio::test]
    async fn tier_outage_degrades_to_miss_with_key() {
        let mem = Arc::new(FakeTier::default());
        mem.disable();
        let svc = CacheService::new(rules(), mem, None);
        let req = make_request("GET", "/things", &[]);

        let result = svc.lookup(&req).await;
        assert!(result.key.is_some());
        assert!(result.response.is_none());
    }

    #[tokio::test]
    async fn malformed_forwarding_header_yields_uncacheable() {
        let mem = Arc::new(FakeTier::default());
        let svc = CacheService::new(rules(), mem.clone(), None);
        let req = make_request("GET", "/things", &[("X-Forwarded-Uri", "not-a-path")]);

        let result = svc.lookup(&req).await;
        assert!(result.key.is_none());
        assert!(result.response.is_none());
        assert_eq!(mem.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn per_path_override_takes_effect() {
        let mut r = rules();
        r.overrides.insert(
            "/special".to_owned(),
            HashElements {
                use_path: true,
                query_params: vec!["q".to_owned()],
                ..Default::default()
            },
        );
        let svc = CacheService::new(r, Arc::new(FakeTier::default()), None);

        // Under the override only `q` is selected, so junk params agree.
        let a = svc
            .lookup(&make_request("GET", "/special?q=1&junk=2", &[]))
            .await;
        let b = svc
            .lookup(&make_request("GET", "/special?q=1&junk=3", &[]))
            .await;
        assert_eq!(a.key, b.key);

        // Elsewhere the global rules hash every parameter.
        let c = svc.lookup(&make_request("GET", "/other?q=1&junk=2", &[])).await;
        let d = svc.lookup(&make_request("GET", "/other?q=1&junk=3", &[])).await;
        assert_ne!(c.key, d.key);
    }

    #[tokio::test]
    async fn override_requires_exact_path() {
        let mut r = rules();
        r.overrides.insert(
            "/special".to_owned(),
            HashElements {
                use_path: false,
                headers: vec!["X-Never-Sent".to_owned()],
                query_params: vec!["X-Never-Sent".to_owned()],
            },
        );
        let svc = CacheService::new(r, Arc::new(FakeTier::default()), None);

        // Trailing slash is a different path; the global rules apply and
        // the path participates, so the keys differ.
        let exact = svc.lookup(&make_request("GET", "/special", &[])).await;
        let slashed = svc.lookup(&make_request("GET", "/special/", &[])).await;
        assert_ne!(exact.key, slashed.key);
    }
}

//! Request routing — map URL patterns to handler functions.
//!
//! This module provides [`Router`], which dispatches incoming HTTP requests to handler
//! functions based on the request method and URL path. Two pattern styles are supported:
//!
//! | Pattern              | Matches                                      |
//! |----------------------|----------------------------------------------|
//! | `/larder/healthz`    | exactly `/larder/healthz`                    |
//! | `/files/*`           | any path starting with `/files`              |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/users/` and
//! `/users` are treated as equivalent. Normalization affects matching only; handlers see
//! the request exactly as it arrived.
//!
//! Routes are matched in registration order; the first route whose method and pattern both
//! match the incoming request wins. A route registered with [`Router::any`] matches every
//! method, which is how the proxy's catch-all is mounted behind the admin endpoints.

use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::{Method, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// threads without copying the underlying closure. In practice you never construct this
/// type directly — use [`Router::get`] or [`Router::any`] instead.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below. Router methods accept `impl IntoHandler` so the two-type-parameter where-bound
/// does not need to be repeated at every call site.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `/larder/healthz`.
    Exact(String),
    // Matches any path that starts with the given prefix, e.g. `/files/*`.
    Wildcard(String),
}

impl Pattern {
    // Classifies `pattern`: a `/*` suffix makes it a prefix wildcard, anything else is an
    // exact match. A trailing slash (other than on the root `/`) is stripped first so that
    // `/users/` and `/users` compile to identical patterns.
    fn parse(pattern: &str) -> Self {
        let pattern = normalize(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        Pattern::Exact(pattern.to_string())
    }

    fn matches(&self, path: &str) -> bool {
        let path = normalize(path);

        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Wildcard(prefix) => path.starts_with(prefix),
        }
    }
}

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// A single registered route binding a method filter + pattern to a handler.
struct Route {
    // `None` matches every method.
    method: Option<Method>,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    fn new(method: Option<Method>, pattern: &str, handler: Handler) -> Self {
        Self {
            method,
            pattern: Pattern::parse(pattern),
            handler,
        }
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        match &self.method {
            Some(m) if m != method => false,
            _ => self.pattern.matches(path),
        }
    }
}

/// HTTP request router that dispatches requests to registered handler functions.
///
/// Routes are evaluated in registration order; the first route whose HTTP method and path
/// pattern both match the incoming request is used. When no route matches, a
/// `404 Not Found` response is returned automatically.
///
/// # Examples
///
/// ```rust,no_run
/// use larder::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
///
/// router.get("/larder/healthz", |_ctx| async { Response::new(StatusCode::NoContent) });
/// router.any("/*", |_ctx| async { Response::new(StatusCode::Ok) });
/// ```
pub struct Router {
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use larder::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests matching `path`.
    ///
    /// # Arguments
    ///
    /// - `path` — URL pattern string (e.g. `"/larder/metrics"` or `"/files/*"`).
    /// - `handler` — Async function that receives a [`Context`] and returns a [`Response`].
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Some(Method::Get), path, handler);
    }

    /// Register a handler for requests of any method matching `path`.
    ///
    /// Registered last, with the `"/*"` pattern, this is the catch-all that hands every
    /// remaining request to the gateway.
    pub fn any(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(None, path, handler);
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(&mut self, method: Option<Method>, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route::new(method, path, handler));
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use larder::Router;
    ///
    /// assert!(Router::new().is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch the request in `ctx` to the first matching route and return its response.
    ///
    /// Routes are tested in registration order. The first route whose HTTP method and path
    /// pattern both match wins. If no route matches, a `404 Not Found` response is returned.
    pub async fn route(&self, ctx: Context) -> Response {
        let matched = self
            .routes
            .iter()
            .find(|route| route.matches(ctx.request().method(), ctx.request().path()));

        match matched {
            Some(route) => (route.handler)(ctx).await,
            None => Response::new(StatusCode::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    fn make_ctx(method: &str, path: &str) -> Context {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    // ── Pattern ───────────────────────────────────────────────────────────────

    #[test]
    fn pattern_parse_root() {
        assert!(matches!(Pattern::parse("/"), Pattern::Exact(s) if s == "/"));
    }

    #[test]
    fn pattern_parse_exact() {
        assert!(matches!(Pattern::parse("/users"), Pattern::Exact(s) if s == "/users"));
    }

    #[test]
    fn pattern_parse_trailing_slash_stripped() {
        // "/users/" should be normalized to "/users"
        assert!(matches!(Pattern::parse("/users/"), Pattern::Exact(s) if s == "/users"));
    }

    #[test]
    fn pattern_parse_wildcard() {
        assert!(matches!(
            Pattern::parse("/files/*"),
            Pattern::Wildcard(s) if s == "/files"
        ));
    }

    #[test]
    fn pattern_parse_catch_all() {
        assert!(matches!(Pattern::parse("/*"), Pattern::Wildcard(s) if s.is_empty()));
    }

    #[test]
    fn pattern_exact_match() {
        let pat = Pattern::parse("/users");
        assert!(pat.matches("/users"));
        assert!(pat.matches("/users/"));
        assert!(!pat.matches("/posts"));
    }

    #[test]
    fn pattern_exact_match_root() {
        let pat = Pattern::parse("/");
        assert!(pat.matches("/"));
        assert!(!pat.matches("/other"));
    }

    #[test]
    fn pattern_wildcard_match() {
        let pat = Pattern::parse("/files/*");
        assert!(pat.matches("/files/docs/readme.txt"));
        assert!(!pat.matches("/other/readme.txt"));
    }

    #[test]
    fn pattern_catch_all_matches_everything() {
        let pat = Pattern::parse("/*");
        assert!(pat.matches("/"));
        assert!(pat.matches("/anything"));
        assert!(pat.matches("/deeply/nested/path"));
    }

    // ── Router ────────────────────────────────────────────────────────────────

    #[test]
    fn router_starts_empty() {
        let router = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn router_len_increments_on_add() {
        let mut router = Router::new();
        router.get("/a", |_ctx| async { Response::new(StatusCode::Ok) });
        router.any("/*", |_ctx| async { Response::new(StatusCode::Ok) });
        assert_eq!(router.len(), 2);
        assert!(!router.is_empty());
    }

    #[tokio::test]
    async fn router_empty_returns_404() {
        let router = Router::new();
        let res = router.route(make_ctx("GET", "/")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn router_get_matches() {
        let mut router = Router::new();
        router.get("/hello", |_ctx| async { Response::new(StatusCode::Ok) });
        let res = router.route(make_ctx("GET", "/hello")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn router_get_does_not_match_post() {
        let mut router = Router::new();
        router.get("/hello", |_ctx| async { Response::new(StatusCode::Ok) });
        let res = router.route(make_ctx("POST", "/hello")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn router_any_matches_every_method() {
        let mut router = Router::new();
        router.any("/proxy", |_ctx| async { Response::new(StatusCode::Ok) });
        for method in ["GET", "POST", "PUT", "DELETE", "PATCH"] {
            let res = router.route(make_ctx(method, "/proxy")).await;
            assert_eq!(res.status(), StatusCode::Ok, "method {method}");
        }
    }

    #[tokio::test]
    async fn router_first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/path", |_ctx| async { Response::new(StatusCode::Ok) });
        router.get("/path", |_ctx| async {
            Response::new(StatusCode::Accepted)
        });

        let res = router.route(make_ctx("GET", "/path")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn router_admin_routes_shadow_the_catch_all() {
        let mut router = Router::new();
        router.get("/larder/healthz", |_ctx| async {
            Response::new(StatusCode::NoContent)
        });
        router.any("/*", |_ctx| async { Response::new(StatusCode::Ok) });

        let admin = router.route(make_ctx("GET", "/larder/healthz")).await;
        assert_eq!(admin.status(), StatusCode::NoContent);

        let proxied = router.route(make_ctx("GET", "/everything/else")).await;
        assert_eq!(proxied.status(), StatusCode::Ok);

        // A non-GET on the admin path falls through to the catch-all.
        let posted = router.route(make_ctx("POST", "/larder/healthz")).await;
        assert_eq!(posted.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn router_handler_sees_the_unnormalized_request() {
        let mut router = Router::new();
        router.get("/echo", |ctx: Context| async move {
            Response::new(StatusCode::Ok).body(ctx.request().target().to_owned())
        });
        let res = router.route(make_ctx("GET", "/echo/")).await;
        assert_eq!(res.body_slice(), b"/echo/");
    }
}

//! larder binary — loads the configuration and wires the pipeline.
//!
//! Boot order matters: the configuration carries the log settings, so it
//! is loaded first; the redis tier connects eagerly so a bad cluster stops
//! the boot instead of surfacing per-request; the server starts last.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use larder::cache::{CacheService, MemoryTier, RedisTier, Tier};
use larder::config::Config;
use larder::context::{ClientAddr, Context};
use larder::gateway::Gateway;
use larder::logging;
use larder::metrics::Metrics;
use larder::middleware::{MiddlewareHandler, Next, RequestLogger, from_middleware};
use larder::proxy::Forwarder;
use larder::{Response, Router, Server, StatusCode};

#[tokio::main]
async fn main() -> ExitCode {
    // No subscriber exists yet when loading fails, so stderr it is.
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("larder: {err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logger);

    if let Err(err) = run(config).await {
        error!(error = %err, "larder exited with an error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        config = %config.source.display(),
        deployment_env = %config.deployment_env,
        "starting larder"
    );

    let memory: Arc<dyn Tier> = Arc::new(MemoryTier::new());
    let distributed: Option<Arc<dyn Tier>> = match config.redis_nodes() {
        Some(nodes) => {
            let tier = RedisTier::connect(nodes).await?;
            info!("distributed cache tier connected");
            Some(Arc::new(tier))
        }
        None => {
            info!("no redis configured, caching in memory only");
            None
        }
    };

    let cache = Arc::new(CacheService::new(config.cache_rules(), memory, distributed));
    let forwarder = Arc::new(Forwarder::new(config.services.proxy.upstreams.clone())?);
    let metrics = Arc::new(Metrics::new());
    let gateway = Arc::new(Gateway::new(cache, forwarder, Arc::clone(&metrics)));

    let router = Arc::new(build_router(gateway, metrics));
    let chain: Vec<MiddlewareHandler> =
        vec![from_middleware(Arc::new(RequestLogger)), terminal(router)];

    let server = Server::bind(config.listen_addr()).await?;
    server
        .run(move |request, peer| {
            let chain = chain.clone();
            async move {
                let mut ctx = Context::new(request);
                ctx.extensions_mut().insert(ClientAddr(peer));
                Next::new(chain).run(ctx).await
            }
        })
        .await?;
    Ok(())
}

/// Admin endpoints first, then the catch-all that proxies everything else.
fn build_router(gateway: Arc<Gateway>, metrics: Arc<Metrics>) -> Router {
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
    router
}

/// The pipeline's terminal stage: dispatch into the router, ignoring `Next`.
fn terminal(router: Arc<Router>) -> MiddlewareHandler {
    Arc::new(move |ctx: Context, _next: Next| {
        let router = Arc::clone(&router);
        Box::pin(async move { router.route(ctx).await })
    })
}

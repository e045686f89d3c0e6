use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::Request,
    middleware,
    routing::{get, post},
};
use tiercache_core::{
    CacheMiddleware, CacheOrchestrator, DynDistributedTier, HttpCdnPurger, InvalidationListener, ListenerHandle,
    InvalidationService, RedisTier, SweeperHandle, WarmupReport, WarmupRunner, WarmupTask,
};
use tower::ServiceExt;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{config::AppConfig, handlers, middleware as app_middleware, origin::OriginClient};

/// Shared state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cache: CacheMiddleware,
    pub invalidation: Arc<InvalidationService>,
    pub origin: Arc<OriginClient>,
}

impl AppState {
    /// Assemble the cache stack over an already connected distributed tier.
    pub fn new(config: AppConfig, distributed: Option<DynDistributedTier>) -> anyhow::Result<Self> {
        Self::assemble(config, distributed, |invalidation| invalidation)
    }

    /// Connect to Redis when enabled, falling back to local-only on failure.
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let Some(redis) = RedisTier::connect(&config.redis).await else {
            return Self::new(config, None);
        };

        let broadcast = config.cache.broadcast_invalidations.then(|| redis.pool().clone());
        Self::assemble(config, Some(Arc::new(redis) as DynDistributedTier), move |invalidation| {
            match broadcast {
                Some(pool) => invalidation.with_broadcast(pool),
                None => invalidation,
            }
        })
    }

    fn assemble(
        config: AppConfig,
        distributed: Option<DynDistributedTier>,
        configure: impl FnOnce(InvalidationService) -> InvalidationService,
    ) -> anyhow::Result<Self> {
        let cache_config = Arc::new(config.cache.clone());
        let orchestrator = CacheOrchestrator::from_config(&cache_config, distributed);

        let mut invalidation = InvalidationService::for_orchestrator(&orchestrator);
        if let Some(cdn) = HttpCdnPurger::from_config(&config.cdn)? {
            tracing::info!(purge_url = %cdn.purge_url(), "CDN purge enabled");
            invalidation = invalidation.with_cdn(Arc::new(cdn));
        }

        let origin = OriginClient::new(&config.origin)?;

        Ok(Self {
            cache: CacheMiddleware::new(orchestrator, cache_config),
            invalidation: Arc::new(configure(invalidation)),
            origin: Arc::new(origin),
            config: Arc::new(config),
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    // Everything outside the admin routes is proxied, through the cache for configured namespaces
    let proxied = Router::new()
        .fallback(handlers::proxy)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::response_cache_layer,
        ))
        .with_state(state.clone());

    Router::new()
        // Health and admin endpoints
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .route("/cache/stats", get(handlers::cache_stats))
        .route("/cache/invalidate", post(handlers::invalidate))
        .fallback_service(proxied)
        .with_state(state)
        // Middleware stack (order: request id -> metrics -> compression/cors/trace -> body limit)
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(middleware::from_fn(app_middleware::http_metrics))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(|res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                    span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                    let x_cache = res
                        .headers()
                        .get("x-cache")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info!(
                        http.status = %res.status().as_u16(),
                        x_cache,
                        elapsed_ms = %latency.as_millis(),
                        "request handled"
                    );
                }),
        )
        .layer(DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<TiercacheServer> {
        let redis_url = self.config.redis.url.clone();
        let broadcast = self.config.cache.broadcast_invalidations;
        let sweep_interval = self.config.cache.sweep_interval();

        let state = AppState::from_config(self.config).await?;
        let local = Arc::clone(state.cache.orchestrator().local());

        let sweeper = local.spawn_sweeper(sweep_interval);
        let listener = (broadcast && state.cache.orchestrator().distributed().is_some()).then(|| {
            InvalidationListener {
                redis_url,
                local: Arc::clone(&local),
            }
            .start()
        });

        tracing::info!(mode = %state.cache.orchestrator().mode(), "cache initialized");

        Ok(TiercacheServer {
            addr: self.addr,
            app: build_app(state.clone()),
            state,
            _sweeper: sweeper,
            _listener: listener,
        })
    }
}

pub struct TiercacheServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    _sweeper: SweeperHandle,
    _listener: Option<ListenerHandle>,
}

impl TiercacheServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Prime every configured warmup path through the full request pipeline.
    pub async fn warm(&self) -> WarmupReport {
        let warmup = &self.state.config.warmup;
        let tasks = warmup
            .paths
            .iter()
            .map(|path| {
                let app = self.app.clone();
                let path = path.clone();
                WarmupTask::new(path.clone(), async move {
                    let req = Request::get(path.as_str()).body(Body::empty())?;
                    let res = app.oneshot(req).await?;
                    anyhow::ensure!(res.status().is_success(), "origin answered {}", res.status());
                    Ok(())
                })
            })
            .collect();

        WarmupRunner::with_timeout(warmup.timeout()).warm(tasks).await
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if !self.state.config.warmup.paths.is_empty() {
            let report = self.warm().await;
            for (path, error) in &report.failed {
                tracing::warn!(path = %path, error = %error, "warmup failed");
            }
            tracing::info!(succeeded = report.succeeded, failed = report.failed.len(), "warmup finished");
        }

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

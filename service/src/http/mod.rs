//! HTTP surface
//!
//! Route table, shared state, middleware ordering, and the error-to-status
//! mapping. Handlers live in [`handlers`]; the SSE subscription handler in
//! [`stream`]; ownership checks in [`auth`]; the fixed-window limiter in
//! [`rate_limit`].

pub mod auth;
pub mod handlers;
pub mod rate_limit;
pub mod stream;

use std::sync::Arc;

use abacus_core::CounterError;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::Engine;
use crate::metrics::Metrics;
use crate::ops::{random_name, Counters};
use crate::stats::StatsAggregator;
use crate::store::Store;

/// Shared application state behind every handler
#[derive(Clone)]
pub struct AppState {
    /// Counter operations façade
    pub counters: Arc<Counters>,
    /// Fan-out engine
    pub engine: Arc<Engine>,
    /// Store handle (stats endpoint, rate limiter)
    pub store: Arc<dyn Store>,
    /// Route-stats recorder
    pub stats: StatsAggregator,
    /// Service configuration
    pub config: Arc<Config>,
    /// Process start, for uptime reporting
    pub started_at: std::time::Instant,
    /// Random name identifying this process in `/stats`
    pub shard: Arc<str>,
}

impl AppState {
    /// Wire up the state graph: engine, operations, stats recorder
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let engine = Engine::start(config.engine.clone());
        let counters = Arc::new(Counters::new(Arc::clone(&store), Arc::clone(&engine)));
        Self {
            counters,
            engine,
            store,
            stats: StatsAggregator::new(),
            config: Arc::new(config),
            started_at: std::time::Instant::now(),
            shard: random_name().into(),
        }
    }
}

/// Error wrapper translating [`CounterError`] to a status and JSON body
pub struct ApiError(pub CounterError);

impl<E: Into<CounterError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CounterError::Validation(_) | CounterError::Genuine | CounterError::Overflow => {
                StatusCode::BAD_REQUEST
            }
            CounterError::RouteNotFound | CounterError::NotFound => StatusCode::NOT_FOUND,
            CounterError::AlreadyExists
            | CounterError::MissingForOp
            | CounterError::MissingForUpdate => StatusCode::CONFLICT,
            CounterError::MissingToken | CounterError::InvalidToken => StatusCode::UNAUTHORIZED,
            CounterError::Store(detail) => {
                tracing::error!(detail = %detail, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Build the full application router
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/healthcheck", get(handlers::healthcheck))
        .route("/docs", get(handlers::docs_redirect))
        .route("/stats", get(handlers::stats_view))
        .route("/metrics", get(handlers::metrics_export))
        .route("/get/{namespace}/{key}", get(handlers::get_counter))
        .route("/get/{namespace}/{key}/shield", get(handlers::get_shield))
        .route("/hit/{namespace}/{key}", get(handlers::hit_counter))
        .route("/hit/{namespace}/{key}/shield", get(handlers::hit_shield))
        .route("/stream/{namespace}", get(stream::stream_counter))
        .route("/stream/{namespace}/{*key}", get(stream::stream_counter))
        .route(
            "/create/",
            get(handlers::create_random).post(handlers::create_random),
        )
        .route(
            "/create/{namespace}",
            get(handlers::create_counter).post(handlers::create_counter),
        )
        .route(
            "/create/{namespace}/{*key}",
            get(handlers::create_counter).post(handlers::create_counter),
        )
        .route("/info/{namespace}", get(handlers::info_counter))
        .route("/info/{namespace}/{*key}", get(handlers::info_counter));

    let admin = Router::new()
        .route("/delete/{namespace}", post(handlers::delete_counter))
        .route("/delete/{namespace}/{*key}", post(handlers::delete_counter))
        .route("/set/{namespace}", post(handlers::set_counter))
        .route("/set/{namespace}/{*key}", post(handlers::set_counter))
        .route("/reset/{namespace}", post(handlers::reset_counter))
        .route("/reset/{namespace}/{*key}", post(handlers::reset_counter))
        .route("/update/{namespace}", post(handlers::update_counter))
        .route("/update/{namespace}/{*key}", post(handlers::update_counter))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    let mut routed = public.merge(admin);
    if state.config.rate_limit_enabled {
        routed = routed.layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::fixed_window,
        ));
        tracing::info!("rate limiting enabled");
    }
    // Stats run outermost on routed paths so even rate-limited requests are
    // counted; the fallback stays outside, untracked paths must never grow
    // the stats map.
    routed = routed.layer(middleware::from_fn_with_state(state.clone(), record_stats));

    routed
        .fallback(handlers::docs_redirect)
        .layer(cors_layer())
        .with_state(state)
}

/// Record the first path segment for every routed request
async fn record_stats(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if let Some(segment) = path.trim_start_matches('/').split('/').next() {
        if !segment.is_empty() {
            state.stats.record(segment);
            if let Some(metrics) = Metrics::get() {
                metrics.record_request(segment);
            }
        }
    }
    next.run(request).await
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(12 * 60 * 60))
}

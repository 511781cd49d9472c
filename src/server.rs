use axum::{middleware as axum_mw, routing::get, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::monitoring;
use crate::metrics::stream;
use crate::middleware::{rate_limit, telemetry};
use crate::AppState;

/// Tells long-lived responses (the SSE stream) that the server is stopping,
/// so graceful shutdown is not held open by connected dashboards.
#[derive(Debug, Clone)]
pub struct Shutdown(Arc<watch::Sender<bool>>);

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the full Axum `Router`: the monitoring read API under
/// `/api/monitoring`, the health check, and the global middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    let monitoring = Router::new()
        .route("/overview", get(monitoring::overview))
        .route("/api-metrics", get(monitoring::api_metrics))
        // ── Endpoints ───────────────────────────────────────────
        .route("/endpoints", get(monitoring::endpoints))
        .route("/endpoints/slowest", get(monitoring::slowest_endpoints))
        // ── Errors ──────────────────────────────────────────────
        .route("/errors", get(monitoring::errors))
        .route("/errors/types", get(monitoring::error_types))
        .route("/errors/trends", get(monitoring::error_trends))
        .route("/errors/by-type", get(monitoring::errors_by_type))
        // ── Queries ─────────────────────────────────────────────
        .route("/queries", get(monitoring::queries))
        .route("/queries/slowest", get(monitoring::slowest_queries))
        .route("/queries/frequent", get(monitoring::frequent_queries))
        .route("/queries/slow", get(monitoring::slow_query_log))
        // ── System ──────────────────────────────────────────────
        .route("/system", get(monitoring::system))
        .route("/stream", get(stream::overview_stream))
        .route_layer(axum_mw::from_fn_with_state(
            state.limiters.general.clone(),
            rate_limit::rate_limit,
        ));

    Router::new()
        .nest("/api/monitoring", monitoring)
        .route("/health", get(monitoring::health))
        // ── Provide shared state to all routes above ────────────
        .with_state(state.clone())
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn_with_state(
            state,
            telemetry::request_telemetry,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

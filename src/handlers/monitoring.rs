use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::{ApiResponse, AppError};
use crate::metrics::{ApiOverview, EndpointStat, ErrorRecord, QueryStat, SortBy};
use crate::system::SystemSnapshot;
use crate::AppState;

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_ERROR_LIMIT: usize = 50;
const MAX_LIMIT: usize = 100;
const DEFAULT_TREND_DAYS: u32 = 7;

/// Items shown per section of the composite overview
const OVERVIEW_SECTION: usize = 5;

// ─── Query parameters ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub sort: Option<SortBy>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorParams {
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TrendParams {
    pub days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DateParams {
    pub date: Option<String>,
}

fn limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_LIMIT)
}

// ─── GET /api/monitoring/overview ────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Overview {
    pub api: ApiOverview,
    pub top_endpoints: Vec<EndpointStat>,
    pub recent_errors: Vec<ErrorRecord>,
    pub slow_queries: Vec<QueryStat>,
    pub system: SystemSnapshot,
}

/// Dashboard landing payload. A section whose read fails is served empty.
pub async fn overview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let aggregator = &state.aggregator;
    let (api, top_endpoints, recent_errors, slow_queries, system) = tokio::join!(
        aggregator.api_overview(),
        aggregator.endpoint_stats(OVERVIEW_SECTION, SortBy::Count),
        aggregator.recent_errors(OVERVIEW_SECTION, None),
        aggregator.slowest_queries(OVERVIEW_SECTION),
        state.system.snapshot(),
    );

    let mut recent_errors = degrade("recent_errors", recent_errors);
    redact_stacks(&state, &mut recent_errors);

    ApiResponse::ok(Overview {
        api: degrade("api", api),
        top_endpoints: degrade("top_endpoints", top_endpoints),
        recent_errors,
        slow_queries: degrade("slow_queries", slow_queries),
        system,
    })
}

fn degrade<T: Default, E: std::fmt::Display>(section: &str, result: Result<T, E>) -> T {
    result.unwrap_or_else(|err| {
        warn!(section, error = %err, "overview section unavailable");
        T::default()
    })
}

fn redact_stacks(state: &AppState, records: &mut [ErrorRecord]) {
    if state.config.environment.is_production() {
        for record in records {
            record.stack = None;
        }
    }
}

// ─── API metrics ─────────────────────────────────────────────────

pub async fn api_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let overview = state
        .aggregator
        .api_overview()
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(overview))
}

pub async fn endpoints(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .aggregator
        .endpoint_stats(limit(params.limit, DEFAULT_LIMIT), params.sort.unwrap_or_default())
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(stats))
}

pub async fn slowest_endpoints(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .aggregator
        .slowest_endpoints(limit(params.limit, DEFAULT_LIMIT))
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(stats))
}

// ─── Errors ──────────────────────────────────────────────────────

pub async fn errors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ErrorParams>,
) -> Result<impl IntoResponse, AppError> {
    let mut records = state
        .aggregator
        .recent_errors(
            limit(params.limit, DEFAULT_ERROR_LIMIT),
            params.error_type.as_deref(),
        )
        .await
        .map_err(AppError::store(state.config.environment))?;
    redact_stacks(&state, &mut records);
    Ok(ApiResponse::ok(records))
}

pub async fn error_types(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let types = state
        .aggregator
        .error_types()
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(types))
}

pub async fn error_trends(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TrendParams>,
) -> Result<impl IntoResponse, AppError> {
    let trends = state
        .aggregator
        .error_trends(params.days.unwrap_or(DEFAULT_TREND_DAYS))
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(trends))
}

pub async fn errors_by_type(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DateParams>,
) -> Result<impl IntoResponse, AppError> {
    let date = match params.date.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            AppError::BadRequest(format!("invalid date {raw:?}, expected YYYY-MM-DD"))
        })?),
    };
    let breakdown = state
        .aggregator
        .errors_by_type(date)
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(breakdown))
}

// ─── Queries ─────────────────────────────────────────────────────

pub async fn queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .aggregator
        .query_stats(limit(params.limit, DEFAULT_LIMIT), params.sort.unwrap_or_default())
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(stats))
}

pub async fn slowest_queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .aggregator
        .slowest_queries(limit(params.limit, DEFAULT_LIMIT))
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(stats))
}

pub async fn frequent_queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .aggregator
        .most_frequent_queries(limit(params.limit, DEFAULT_LIMIT))
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(stats))
}

pub async fn slow_query_log(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let log = state
        .aggregator
        .raw_slow_queries(limit(params.limit, DEFAULT_ERROR_LIMIT))
        .await
        .map_err(AppError::store(state.config.environment))?;
    Ok(ApiResponse::ok(log))
}

// ─── System / health ─────────────────────────────────────────────

pub async fn system(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ApiResponse::ok(state.system.snapshot().await)
}

/// Liveness plus store reachability. Always 200.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = match state.store.ping().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "store": store,
        "timestamp": state.clock.now(),
    }))
}

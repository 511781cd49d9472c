use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::metrics::{ErrorEvent, RequestMetric};
use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Endpoint label for requests that matched no route.
const UNMATCHED: &str = "unmatched";

/// Set on a response by a handler that failed; recorded as an error event.
#[derive(Debug, Clone)]
pub struct ReportedError {
    pub error_type: String,
    pub code: String,
    pub message: String,
    pub stack: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Set on a response to attribute the request to a user.
#[derive(Debug, Clone)]
pub struct TelemetryUser(pub String);

/// Request id of the current request, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Measures every request and submits it to the telemetry queue.
///
/// Adds three response headers:
///
///   X-Request-Id        echoed from the request or freshly generated
///   X-Response-Time-Us  total handler wall time in microseconds
///   Server-Timing       same value in the standard Server-Timing format
pub async fn request_telemetry(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let _connection = state.connections.track();

    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED.to_owned());
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let timestamp = state.clock.now();
    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros();

    // ── Inject response headers ─────────────────────────────────
    let headers = response.headers_mut();
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, val);
    }
    if let Ok(val) = us.to_string().parse() {
        headers.insert("X-Response-Time-Us", val);
    }
    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        headers.insert("Server-Timing", val);
    }

    // ── Submit telemetry ────────────────────────────────────────
    let status = response.status().as_u16();
    let user_id = response
        .extensions()
        .get::<TelemetryUser>()
        .map(|u| u.0.clone());
    let reported = response.extensions().get::<ReportedError>().cloned();

    if let Some(err) = &reported {
        state.recorder.on_error_raised(ErrorEvent {
            error_type: err.error_type.clone(),
            code: err.code.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
            endpoint: endpoint.clone(),
            method: method.clone(),
            status_code: status,
            timestamp,
            request_id: Some(request_id.clone()),
            user_id: user_id.clone(),
            metadata: err.metadata.clone(),
        });
    }

    debug!(
        status,
        method = %method,
        endpoint = %endpoint,
        us = us as u64,
        "request completed"
    );

    state.recorder.on_request_complete(RequestMetric {
        endpoint,
        method,
        status_code: status,
        duration_ms: elapsed.as_millis() as u64,
        timestamp,
        request_id,
        user_id,
        error: reported.map(|err| err.message),
    });

    response
}

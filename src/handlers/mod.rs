pub mod monitoring;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::config::Environment;
use crate::error::StoreError;
use crate::middleware::telemetry::ReportedError;

// ─── Shared response envelope ────────────────────────────────────

/// Every successful read is wrapped as `{ "success": true, "data": ... }`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// `{ "success": false, "error": { "code", "message" } }`
pub fn error_body(code: &str, message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": { "code": code, "message": message },
    }))
}

// ─── Unified error type ──────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// A failed store read. Production hides the detail from the client.
    Store {
        source: StoreError,
        environment: Environment,
    },
}

impl AppError {
    /// `map_err` adapter for store reads.
    pub fn store(environment: Environment) -> impl Fn(StoreError) -> Self {
        move |source| Self::Store {
            source,
            environment,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, error_body("BAD_REQUEST", &msg)).into_response()
            }
            Self::Store {
                source,
                environment,
            } => {
                error!(error = %source, "monitoring read failed");
                let message = if environment.is_production() {
                    "Internal server error".to_owned()
                } else {
                    source.to_string()
                };
                let mut response = (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body("INTERNAL_ERROR", &message),
                )
                    .into_response();
                response.extensions_mut().insert(ReportedError {
                    error_type: "StoreError".into(),
                    code: "INTERNAL_ERROR".into(),
                    message: source.to_string(),
                    stack: None,
                    metadata: None,
                });
                response
            }
        }
    }
}

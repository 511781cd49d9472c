pub mod collector;
pub mod errors;
pub mod percentiles;
pub mod queries;
pub mod recorder;
pub mod stream;

pub use collector::{ApiOverview, EndpointStat, HourlyBucket, MetricsAggregator, SortBy};
pub use errors::{ErrorBreakdown, ErrorTrend};
pub use percentiles::DurationStats;
pub use queries::{QueryStat, SlowQuery};
pub use recorder::{Recorder, TelemetryEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed HTTP request.
/// This is the "write" side: the request middleware builds these and pushes them in.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    /// Matched route, e.g. "/api/users/:id"
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub user_id: Option<String>,
    /// Short error description when the handler failed
    pub error: Option<String>,
}

impl RequestMetric {
    /// Dimension under which the endpoint is ranked and sampled,
    /// e.g. "GET /api/users/:id".
    pub fn dimension(&self) -> String {
        endpoint_dimension(&self.method, &self.endpoint)
    }
}

pub(crate) fn endpoint_dimension(method: &str, endpoint: &str) -> String {
    format!("{method} {endpoint}")
}

/// An application error raised while serving a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
    pub stack: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// An [`ErrorEvent`] as stored in the recent-error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One primary-datastore query.
#[derive(Debug, Clone)]
pub struct QueryMetric {
    /// Query text; truncated before it is stored
    pub query: String,
    pub model: String,
    pub operation: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

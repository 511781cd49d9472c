use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::warn;

use super::percentiles::{parse_samples, round2, DurationStats};
use super::RequestMetric;
use crate::clock::Clock;
use crate::error::StoreResult;
use crate::keys::{
    day_label, hour_label, monitoring_key, Granularity, WindowKey, BREAKDOWN_TTL,
    DAILY_TOTAL_TTL, MONITORING, SAMPLE_CAP, SAMPLE_TTL,
};
use crate::store::{Batch, CounterStore};

// ─── Configuration ───────────────────────────────────────────────

/// Endpoints whose samples feed the overview's response-time figures
const OVERVIEW_TOP_ENDPOINTS: usize = 10;

// ─── Key layout ──────────────────────────────────────────────────

pub(super) fn window_key(dimension: &str, granularity: Granularity, bucket: String) -> String {
    WindowKey::new(MONITORING, dimension, granularity, bucket).into()
}

fn daily(dimension: &str, date: NaiveDate) -> String {
    window_key(dimension, Granularity::Day, day_label(date))
}

fn hourly(dimension: &str, date: NaiveDate, hour: u32) -> String {
    window_key(dimension, Granularity::Hour, hour_label(date, hour))
}

fn response_times_key(endpoint: &str) -> String {
    monitoring_key(&["response_times", endpoint])
}

const REQUESTS: &str = "requests";
const ERRORS: &str = "errors";
const ENDPOINTS: &str = "endpoints";
const ENDPOINT_ERRORS: &str = "endpoint_errors";
const LAST_CALL: &str = "last_call";

// ─── Public types ────────────────────────────────────────────────

/// Order used by endpoint and query listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SortBy {
    #[default]
    #[serde(rename = "count")]
    Count,
    #[serde(rename = "avgTime", alias = "avg_time", alias = "avgResponseTime")]
    AvgTime,
}

/// Requests and errors for one hour of the current day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyBucket {
    pub hour: u32,
    pub requests: u64,
    pub errors: u64,
}

/// Headline numbers for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApiOverview {
    pub requests_today: u64,
    pub requests_this_hour: u64,
    pub errors_today: u64,
    pub errors_this_hour: u64,
    /// Percentage with two decimals
    pub error_rate: f64,
    /// Over the union of the top endpoints' recent samples
    pub avg_response_time: f64,
    pub p95_response_time: u64,
    pub hourly: Vec<HourlyBucket>,
}

/// One row of the endpoint table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStat {
    /// e.g. "GET /api/users/:id"
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub calls: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub response_time: DurationStats,
    pub last_called: Option<String>,
}

/// Time-windowed aggregation over a shared [`CounterStore`].
///
/// Writers call `record_*`, the read API calls the derived views. There is no
/// in-process state: all coordination is delegated to store atomicity.
#[derive(Debug)]
pub struct MetricsAggregator {
    pub(super) store: Arc<dyn CounterStore>,
    pub(super) clock: Arc<dyn Clock>,
}

// ─── MetricsAggregator impl ──────────────────────────────────────

impl MetricsAggregator {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub(super) fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Record a single completed request in one atomic round trip.
    /// Store failures are logged and swallowed.
    pub async fn record_request(&self, metric: &RequestMetric) {
        let batch = request_batch(metric);
        if let Err(err) = self.store.exec(batch).await {
            warn!(
                error = %err,
                endpoint = %metric.endpoint,
                "failed to record request metric"
            );
        }
    }

    /// Today's and this hour's totals plus response-time figures.
    pub async fn api_overview(&self) -> StoreResult<ApiOverview> {
        let now = self.clock.now();
        let date = now.date_naive();
        let current_hour = now.hour();

        // [requests today, errors today, (requests h, errors h) for 0..=now]
        let mut counter_keys = vec![daily(REQUESTS, date), daily(ERRORS, date)];
        for hour in 0..=current_hour {
            counter_keys.push(hourly(REQUESTS, date, hour));
            counter_keys.push(hourly(ERRORS, date, hour));
        }
        let counts = self.store.counters(&counter_keys).await?;
        let count_at = |i: usize| counts.get(i).copied().unwrap_or(0).max(0) as u64;

        let hourly: Vec<HourlyBucket> = (0..=current_hour)
            .map(|hour| {
                let base = 2 + 2 * hour as usize;
                HourlyBucket {
                    hour,
                    requests: count_at(base),
                    errors: count_at(base + 1),
                }
            })
            .collect();

        let top = self
            .store
            .ranked(&daily(ENDPOINTS, date), Some(OVERVIEW_TOP_ENDPOINTS))
            .await?;
        let sample_keys: Vec<String> =
            top.iter().map(|(dim, _)| response_times_key(dim)).collect();
        let samples = self.store.lists(&sample_keys, SAMPLE_CAP).await?;
        let stats = DurationStats::from_samples(samples.iter().flat_map(|s| parse_samples(s)));

        let requests_today = count_at(0);
        let errors_today = count_at(1);
        let (requests_this_hour, errors_this_hour) = hourly
            .last()
            .map(|b| (b.requests, b.errors))
            .unwrap_or_default();

        Ok(ApiOverview {
            requests_today,
            requests_this_hour,
            errors_today,
            errors_this_hour,
            error_rate: error_rate(requests_today, errors_today),
            avg_response_time: stats.avg,
            p95_response_time: stats.p95,
            hourly,
        })
    }

    /// Every endpoint seen today, joined with its error count, response-time
    /// sample and last-call time.
    pub async fn endpoint_stats(
        &self,
        limit: usize,
        sort_by: SortBy,
    ) -> StoreResult<Vec<EndpointStat>> {
        let date = self.today();
        let ranked = self.store.ranked(&daily(ENDPOINTS, date), None).await?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let error_counts = self.store.hash(&daily(ENDPOINT_ERRORS, date)).await?;
        let last_calls = self.store.hash(&daily(LAST_CALL, date)).await?;
        let sample_keys: Vec<String> =
            ranked.iter().map(|(dim, _)| response_times_key(dim)).collect();
        let samples = self.store.lists(&sample_keys, SAMPLE_CAP).await?;

        let mut stats: Vec<EndpointStat> = ranked
            .into_iter()
            .zip(samples)
            .map(|((endpoint, score), sample)| {
                let calls = score.max(0.0) as u64;
                let errors = error_counts
                    .get(&endpoint)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                let (method, path) = split_dimension(&endpoint);
                EndpointStat {
                    method,
                    path,
                    calls,
                    errors,
                    error_rate: error_rate(calls, errors),
                    response_time: DurationStats::from_samples(parse_samples(&sample)),
                    last_called: last_calls.get(&endpoint).cloned(),
                    endpoint,
                }
            })
            .collect();

        stats.sort_by(|a, b| {
            let primary = match sort_by {
                SortBy::Count => b.calls.cmp(&a.calls),
                SortBy::AvgTime => b.response_time.avg.total_cmp(&a.response_time.avg),
            };
            match primary {
                Ordering::Equal => a.endpoint.cmp(&b.endpoint),
                other => other,
            }
        });
        stats.truncate(limit);
        Ok(stats)
    }

    /// Endpoints ordered by average response time.
    pub async fn slowest_endpoints(&self, limit: usize) -> StoreResult<Vec<EndpointStat>> {
        self.endpoint_stats(limit, SortBy::AvgTime).await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

fn request_batch(metric: &RequestMetric) -> Batch {
    let ts: DateTime<Utc> = metric.timestamp;
    let date = ts.date_naive();
    let hour = ts.hour();
    let dimension = metric.dimension();

    let mut batch = Batch::new();

    let requests_day = daily(REQUESTS, date);
    let requests_hour = hourly(REQUESTS, date, hour);
    batch
        .incr(&requests_day, 1)
        .expire_once(requests_day, DAILY_TOTAL_TTL)
        .incr(&requests_hour, 1)
        .expire_once(requests_hour, BREAKDOWN_TTL);

    if metric.status_code >= 400 {
        let errors_day = daily(ERRORS, date);
        let errors_hour = hourly(ERRORS, date, hour);
        let endpoint_errors = daily(ENDPOINT_ERRORS, date);
        batch
            .incr(&errors_day, 1)
            .expire_once(errors_day, DAILY_TOTAL_TTL)
            .incr(&errors_hour, 1)
            .expire_once(errors_hour, BREAKDOWN_TTL)
            .hash_incr(&endpoint_errors, &dimension, 1)
            .expire_once(endpoint_errors, BREAKDOWN_TTL);
    }

    let ranking = daily(ENDPOINTS, date);
    let samples = response_times_key(&dimension);
    let last_call = daily(LAST_CALL, date);
    batch
        .rank_incr(&ranking, &dimension, 1.0)
        .expire_once(ranking, BREAKDOWN_TTL)
        .push_capped(&samples, metric.duration_ms.to_string(), SAMPLE_CAP)
        .expire_once(samples, SAMPLE_TTL)
        .hash_set(&last_call, dimension, ts.to_rfc3339())
        .expire_once(last_call, BREAKDOWN_TTL);

    batch
}

/// `errors / requests` as a percentage rounded to two decimals.
pub fn error_rate(requests: u64, errors: u64) -> f64 {
    if requests == 0 {
        return 0.0;
    }
    round2(errors as f64 / requests as f64 * 100.0)
}

fn split_dimension(dimension: &str) -> (String, String) {
    match dimension.split_once(' ') {
        Some((method, path)) => (method.to_owned(), path.to_owned()),
        None => (String::new(), dimension.to_owned()),
    }
}

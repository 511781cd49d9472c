use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::warn;

use super::collector::{MetricsAggregator, SortBy};
use super::percentiles::{parse_samples, DurationStats};
use super::QueryMetric;
use crate::error::{Error, StoreResult};
use crate::keys::{monitoring_key, SAMPLE_CAP, SAMPLE_TTL, SLOW_QUERY_CAP};
use crate::store::Batch;

/// Queries at or above this duration land in the slow query log.
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

/// Stored query text is cut to this many characters.
pub const MAX_QUERY_TEXT: usize = 200;

fn durations_key(dimension: &str) -> String {
    monitoring_key(&["queries", "durations", dimension])
}

fn counts_key() -> String {
    monitoring_key(&["queries", "counts"])
}

fn last_executed_key() -> String {
    monitoring_key(&["queries", "last_executed"])
}

fn slow_log_key() -> String {
    monitoring_key(&["queries", "slow"])
}

/// Aggregate for one `model:operation` pair over the current hour window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStat {
    pub model: String,
    pub operation: String,
    pub count: u64,
    pub avg_time: f64,
    pub min_time: u64,
    pub max_time: u64,
    pub p95_time: u64,
    pub last_executed: Option<String>,
}

/// One entry of the slow query log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQuery {
    pub query: String,
    pub model: String,
    pub operation: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl MetricsAggregator {
    /// Record one datastore query. Store failures are logged and swallowed.
    pub async fn record_query(&self, metric: &QueryMetric) {
        let dimension = format!("{}:{}", metric.model, metric.operation);
        let durations = durations_key(&dimension);
        let counts = counts_key();
        let last = last_executed_key();

        let mut batch = Batch::new();
        batch
            .push_capped(&durations, metric.duration_ms.to_string(), SAMPLE_CAP)
            .expire_once(durations, SAMPLE_TTL)
            .rank_incr(&counts, &dimension, 1.0)
            .expire_once(counts, SAMPLE_TTL)
            .hash_set(&last, &dimension, metric.timestamp.to_rfc3339())
            .expire_once(last, SAMPLE_TTL);

        if metric.duration_ms >= SLOW_QUERY_THRESHOLD_MS {
            let entry = SlowQuery {
                query: truncate(&metric.query, MAX_QUERY_TEXT),
                model: metric.model.clone(),
                operation: metric.operation.clone(),
                duration_ms: metric.duration_ms,
                timestamp: metric.timestamp,
            };
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    let slow = slow_log_key();
                    batch
                        .push_capped(&slow, json, SLOW_QUERY_CAP)
                        .expire_once(slow, SAMPLE_TTL);
                }
                Err(err) => warn!(error = %err, "could not serialize slow query"),
            }
        }

        if let Err(err) = self.store.exec(batch).await {
            warn!(error = %err, query = %dimension, "failed to record query metric");
        }
    }

    /// Running counts joined with duration stats from each pair's sample.
    pub async fn query_stats(&self, limit: usize, sort_by: SortBy) -> StoreResult<Vec<QueryStat>> {
        let ranked = self.store.ranked(&counts_key(), None).await?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let last = self.store.hash(&last_executed_key()).await?;
        let sample_keys: Vec<String> = ranked.iter().map(|(dim, _)| durations_key(dim)).collect();
        let samples = self.store.lists(&sample_keys, SAMPLE_CAP).await?;

        let mut stats: Vec<QueryStat> = ranked
            .into_iter()
            .zip(samples)
            .map(|((dimension, score), sample)| {
                let durations = DurationStats::from_samples(parse_samples(&sample));
                let (model, operation) = dimension
                    .split_once(':')
                    .map(|(m, o)| (m.to_owned(), o.to_owned()))
                    .unwrap_or_else(|| (dimension.clone(), String::new()));
                QueryStat {
                    model,
                    operation,
                    count: score.max(0.0) as u64,
                    avg_time: durations.avg,
                    min_time: durations.min,
                    max_time: durations.max,
                    p95_time: durations.p95,
                    last_executed: last.get(&dimension).cloned(),
                }
            })
            .collect();

        stats.sort_by(|a, b| {
            let primary = match sort_by {
                SortBy::Count => b.count.cmp(&a.count),
                SortBy::AvgTime => b.avg_time.total_cmp(&a.avg_time),
            };
            match primary {
                Ordering::Equal => (&a.model, &a.operation).cmp(&(&b.model, &b.operation)),
                other => other,
            }
        });
        stats.truncate(limit);
        Ok(stats)
    }

    pub async fn slowest_queries(&self, limit: usize) -> StoreResult<Vec<QueryStat>> {
        self.query_stats(limit, SortBy::AvgTime).await
    }

    pub async fn most_frequent_queries(&self, limit: usize) -> StoreResult<Vec<QueryStat>> {
        self.query_stats(limit, SortBy::Count).await
    }

    /// The slow query log as stored, newest first.
    pub async fn raw_slow_queries(&self, limit: usize) -> StoreResult<Vec<SlowQuery>> {
        let key = slow_log_key();
        let raw = self.store.list(&key, limit.min(SLOW_QUERY_CAP)).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(slow) => Some(slow),
                Err(err) => {
                    let err = Error::MalformedValue {
                        key: key.clone(),
                        reason: err.to_string(),
                    };
                    warn!(error = %err, "skipping slow query entry");
                    None
                }
            })
            .collect())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (MetricsAggregator, MockClock) {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        (MetricsAggregator::new(store, Arc::new(clock.clone())), clock)
    }

    fn query(clock: &MockClock, model: &str, operation: &str, ms: u64) -> QueryMetric {
        QueryMetric {
            query: format!("SELECT * FROM {model} WHERE id = $1"),
            model: model.into(),
            operation: operation.into(),
            duration_ms: ms,
            timestamp: clock.now(),
        }
    }

    #[tokio::test]
    async fn stats_sorted_by_count_and_time() {
        let (aggregator, clock) = setup();
        for ms in [10, 20, 30] {
            aggregator.record_query(&query(&clock, "Job", "findMany", ms)).await;
        }
        aggregator.record_query(&query(&clock, "User", "findUnique", 250)).await;

        let frequent = aggregator.most_frequent_queries(10).await.unwrap();
        assert_eq!(frequent.len(), 2);
        assert_eq!(frequent[0].model, "Job");
        assert_eq!(frequent[0].operation, "findMany");
        assert_eq!(frequent[0].count, 3);
        assert_eq!(frequent[0].avg_time, 20.0);
        assert_eq!(frequent[0].min_time, 10);
        assert_eq!(frequent[0].max_time, 30);

        let slowest = aggregator.slowest_queries(1).await.unwrap();
        assert_eq!(slowest.len(), 1);
        assert_eq!(slowest[0].model, "User");
    }

    #[tokio::test]
    async fn multi_second_durations_are_reported_exactly() {
        let (aggregator, clock) = setup();
        for ms in [5000, 3001, 12345] {
            aggregator.record_query(&query(&clock, "Report", "aggregate", ms)).await;
        }

        let stat = &aggregator.slowest_queries(1).await.unwrap()[0];
        assert_eq!(stat.min_time, 3001);
        assert_eq!(stat.max_time, 12345);
        assert_eq!(stat.avg_time, 6782.0);
    }

    #[tokio::test]
    async fn only_slow_queries_are_logged() {
        let (aggregator, clock) = setup();
        aggregator.record_query(&query(&clock, "Job", "findMany", 99)).await;
        aggregator.record_query(&query(&clock, "Job", "update", 100)).await;

        let slow = aggregator.raw_slow_queries(50).await.unwrap();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].operation, "update");
        assert_eq!(slow[0].duration_ms, 100);
    }

    #[tokio::test]
    async fn query_counters_expire_after_an_hour() {
        let (aggregator, clock) = setup();
        aggregator.record_query(&query(&clock, "Job", "findMany", 150)).await;
        assert_eq!(aggregator.most_frequent_queries(10).await.unwrap()[0].count, 1);

        clock.advance(Duration::from_secs(3600));
        assert!(aggregator.most_frequent_queries(10).await.unwrap().is_empty());
        assert!(aggregator.raw_slow_queries(10).await.unwrap().is_empty());
    }

    #[test]
    fn long_query_text_is_truncated() {
        let long = "x".repeat(MAX_QUERY_TEXT + 50);
        let cut = truncate(&long, MAX_QUERY_TEXT);
        assert_eq!(cut.len(), MAX_QUERY_TEXT + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("ünïcode", 3), "ünï...");
        assert_eq!(truncate("short", 10), "short");
    }
}

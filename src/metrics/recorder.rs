use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ErrorEvent, MetricsAggregator, QueryMetric, RequestMetric};

/// Anything the surrounding application reports.
#[derive(Debug)]
pub enum TelemetryEvent {
    Request(RequestMetric),
    Error(ErrorEvent),
    Query(QueryMetric),
}

impl TelemetryEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Error(_) => "error",
            Self::Query(_) => "query",
        }
    }
}

/// Fire-and-forget ingestion handle.
///
/// Submissions never block and never fail the caller: events go onto a
/// bounded queue drained by a single background task. When the queue is full
/// the event is dropped and a warning is logged.
#[derive(Debug, Clone)]
pub struct Recorder {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl Recorder {
    /// Spawns the worker on the current tokio runtime. The worker exits once
    /// every `Recorder` clone is dropped and the queue is drained.
    pub fn spawn(aggregator: Arc<MetricsAggregator>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(worker(aggregator, rx));
        (Self { tx }, handle)
    }

    pub fn on_request_complete(&self, metric: RequestMetric) {
        self.submit(TelemetryEvent::Request(metric));
    }

    pub fn on_error_raised(&self, event: ErrorEvent) {
        self.submit(TelemetryEvent::Error(event));
    }

    pub fn on_data_store_query(&self, metric: QueryMetric) {
        self.submit(TelemetryEvent::Query(metric));
    }

    pub fn submit(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(kind = event.kind(), "telemetry queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(kind = event.kind(), "telemetry worker stopped, dropping event");
            }
        }
    }
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(aggregator: Arc<MetricsAggregator>, mut rx: mpsc::Receiver<TelemetryEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            TelemetryEvent::Request(metric) => aggregator.record_request(metric).await,
            TelemetryEvent::Error(error) => aggregator.record_error(error).await,
            TelemetryEvent::Query(query) => aggregator.record_query(query).await,
        }
    }
    debug!("telemetry queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::metrics::SortBy;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn worker_drains_queue_after_last_handle_drops() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 11, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let aggregator = Arc::new(MetricsAggregator::new(store, Arc::new(clock.clone())));
        let (recorder, handle) = Recorder::spawn(aggregator.clone(), 16);

        for i in 0..5 {
            recorder.on_request_complete(RequestMetric {
                endpoint: "/api/reviews".into(),
                method: "POST".into(),
                status_code: 201,
                duration_ms: 10 + i,
                timestamp: clock.now(),
                request_id: format!("req-{i}"),
                user_id: Some("user-1".into()),
                error: None,
            });
        }
        recorder.on_data_store_query(QueryMetric {
            query: "INSERT INTO reviews".into(),
            model: "Review".into(),
            operation: "create".into(),
            duration_ms: 4,
            timestamp: clock.now(),
        });

        drop(recorder);
        handle.await.unwrap();

        let endpoints = aggregator.endpoint_stats(10, SortBy::Count).await.unwrap();
        assert_eq!(endpoints[0].calls, 5);
        assert_eq!(aggregator.most_frequent_queries(5).await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let recorder = Recorder { tx };
        let metric = QueryMetric {
            query: "SELECT 1".into(),
            model: "Job".into(),
            operation: "count".into(),
            duration_ms: 1,
            timestamp: Utc::now(),
        };
        recorder.on_data_store_query(metric.clone());
        // Second submission hits a full queue and returns immediately.
        recorder.on_data_store_query(metric);

        assert!(matches!(rx.try_recv(), Ok(TelemetryEvent::Query(_))));
        assert!(rx.try_recv().is_err());
    }
}

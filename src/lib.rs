//! Redis-backed windowed counting for request telemetry and rate limiting.
//!
//! Writers submit events through a [`metrics::Recorder`]; a background worker
//! folds them into time-bucketed counters, bounded samples and ranked sets in
//! a [`store::CounterStore`]. The read API under `/api/monitoring` derives
//! dashboard views from those keys, and [`limiter::RateLimiter`] runs
//! fixed-window limits over the same store.

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod server;
pub mod store;
pub mod system;

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::Config;
use crate::limiter::Limiters;
use crate::metrics::{MetricsAggregator, Recorder};
use crate::server::Shutdown;
use crate::store::CounterStore;
use crate::system::{ConnectionGauge, SystemMonitor, TcpProbe};

/// Shared application state available to every handler via `State<Arc<AppState>>`.
#[derive(Debug)]
pub struct AppState {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn CounterStore>,

    /// Read side of the telemetry engine.
    pub aggregator: Arc<MetricsAggregator>,

    /// Write side: non-blocking submission to the recording worker.
    pub recorder: Recorder,

    /// Requests in flight, maintained by the telemetry middleware.
    pub connections: Arc<ConnectionGauge>,

    pub system: SystemMonitor,
    pub limiters: Limiters,

    /// Fired once the process starts shutting down.
    pub shutdown: Shutdown,
}

impl AppState {
    /// Wire every component onto `store` and spawn the recording worker.
    ///
    /// The returned handle completes once every [`Recorder`] clone (including
    /// the one held by the state) is dropped and the queue is drained.
    pub fn new(
        config: Config,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> error::Result<(Arc<Self>, JoinHandle<()>)> {
        let limiters = Limiters::from_config(&config, store.clone(), clock.clone())?;
        let aggregator = Arc::new(MetricsAggregator::new(store.clone(), clock.clone()));
        let (recorder, worker) =
            Recorder::spawn(aggregator.clone(), config.telemetry_queue_capacity);

        let connections = Arc::new(ConnectionGauge::new());
        let mut system = SystemMonitor::new(store.clone(), clock.clone(), connections.clone());
        if let Some(addr) = &config.database_addr {
            system = system.with_probe(TcpProbe::new("database", addr.clone()));
        }

        let state = Arc::new(Self {
            config,
            clock,
            store,
            aggregator,
            recorder,
            connections,
            system,
            limiters,
            shutdown: Shutdown::new(),
        });
        Ok((state, worker))
    }
}

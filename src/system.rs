//! Host gauges and dependency health, cached in the shared store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Error;
use crate::keys::monitoring_key;
use crate::store::CounterStore;

/// How long a computed snapshot is served from the cache.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(15);

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

fn snapshot_key() -> String {
    monitoring_key(&["system", "snapshot"])
}

// ─── Active connections ──────────────────────────────────────────

/// Requests currently in flight.
#[derive(Debug, Default)]
pub struct ConnectionGauge {
    active: AtomicI64,
}

impl ConnectionGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.active.load(Ordering::Relaxed).max(0) as u64
    }

    /// Counts one connection until the guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.opened();
        ConnectionGuard {
            gauge: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    gauge: Arc<ConnectionGauge>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.closed();
    }
}

// ─── Health probes ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub status: DependencyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, String>,
}

impl DependencyStatus {
    pub fn connected(info: BTreeMap<String, String>) -> Self {
        Self {
            status: DependencyState::Connected,
            error: None,
            info,
        }
    }

    pub fn disconnected(error: impl ToString) -> Self {
        Self {
            status: DependencyState::Disconnected,
            error: Some(error.to_string()),
            info: BTreeMap::new(),
        }
    }
}

/// A dependency the snapshot reports on. Probes never fail; problems are
/// reported as [`DependencyState::Disconnected`].
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn probe(&self) -> DependencyStatus;
}

/// Checks the counter store with `PING` and attaches selected `INFO` fields.
#[derive(Debug)]
pub struct StoreProbe {
    store: Arc<dyn CounterStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &str {
        "redis"
    }

    async fn probe(&self) -> DependencyStatus {
        if let Err(err) = self.store.ping().await {
            return DependencyStatus::disconnected(err);
        }
        let info: HashMap<String, String> = self.store.info().await.unwrap_or_else(|err| {
            debug!(error = %err, "store info unavailable");
            HashMap::new()
        });
        DependencyStatus::connected(info.into_iter().collect())
    }
}

/// Connects to `host:port` over TCP.
#[derive(Debug)]
pub struct TcpProbe {
    name: String,
    addr: String,
}

impl TcpProbe {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> DependencyStatus {
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => DependencyStatus::connected(BTreeMap::new()),
            Ok(Err(err)) => DependencyStatus::disconnected(err),
            Err(_) => DependencyStatus::disconnected(format!(
                "connect timed out after {}ms",
                PROBE_TIMEOUT.as_millis()
            )),
        }
    }
}

// ─── Snapshot ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// bytes
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// 1, 5 and 15 minute load averages
    pub load_average: [f64; 3],
    pub cores: usize,
    /// Percent across all cores
    pub usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub uptime_secs: u64,
    pub memory: MemoryUsage,
    pub cpu: CpuUsage,
    pub active_connections: u64,
    pub dependencies: BTreeMap<String, DependencyStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Computes [`SystemSnapshot`]s and caches them in the store for
/// [`SNAPSHOT_TTL`].
#[derive(Debug)]
pub struct SystemMonitor {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    connections: Arc<ConnectionGauge>,
    probes: Vec<Box<dyn HealthProbe>>,
    sys: Mutex<System>,
    started_at: DateTime<Utc>,
}

impl SystemMonitor {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        connections: Arc<ConnectionGauge>,
    ) -> Self {
        let started_at = clock.now();
        Self {
            probes: vec![Box::new(StoreProbe::new(store.clone()))],
            store,
            clock,
            connections,
            sys: Mutex::new(System::new()),
            started_at,
        }
    }

    pub fn with_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    /// Cached snapshot if younger than [`SNAPSHOT_TTL`], otherwise a fresh
    /// one. Never fails: cache errors fall back to recomputing.
    pub async fn snapshot(&self) -> SystemSnapshot {
        let key = snapshot_key();
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(cached) => return cached,
                Err(err) => {
                    let err = Error::MalformedValue {
                        key: key.clone(),
                        reason: err.to_string(),
                    };
                    warn!(error = %err, "discarding cached system snapshot");
                }
            },
            Ok(None) => {}
            Err(err) => debug!(error = %err, "snapshot cache unavailable"),
        }

        let snapshot = self.compute().await;
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(err) = self.store.set_with_ttl(&key, &json, SNAPSHOT_TTL).await {
                    debug!(error = %err, "could not cache system snapshot");
                }
            }
            Err(err) => warn!(error = %err, "could not serialize system snapshot"),
        }
        snapshot
    }

    async fn compute(&self) -> SystemSnapshot {
        let now = self.clock.now();
        let (memory, cpu) = self.host_gauges();

        let mut dependencies = BTreeMap::new();
        for probe in &self.probes {
            dependencies.insert(probe.name().to_owned(), probe.probe().await);
        }

        SystemSnapshot {
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            memory,
            cpu,
            active_connections: self.connections.current(),
            dependencies,
            timestamp: now,
        }
    }

    fn host_gauges(&self) -> (MemoryUsage, CpuUsage) {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        sys.refresh_cpu();

        let used = sys.used_memory();
        let total = sys.total_memory();
        let percentage = if total == 0 {
            0.0
        } else {
            crate::metrics::percentiles::round2(used as f64 / total as f64 * 100.0)
        };

        let load = System::load_average();
        let cpu = CpuUsage {
            load_average: [load.one, load.five, load.fifteen],
            cores: sys.cpus().len(),
            usage: crate::metrics::percentiles::round2(sys.global_cpu_info().cpu_usage() as f64),
        };

        (
            MemoryUsage {
                used,
                total,
                percentage,
            },
            cpu,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    #[derive(Debug)]
    struct DownProbe;

    #[async_trait]
    impl HealthProbe for DownProbe {
        fn name(&self) -> &str {
            "database"
        }

        async fn probe(&self) -> DependencyStatus {
            DependencyStatus::disconnected("connection refused")
        }
    }

    fn monitor() -> (SystemMonitor, Arc<MemoryStore>, MockClock, Arc<ConnectionGauge>) {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let gauge = Arc::new(ConnectionGauge::new());
        let monitor = SystemMonitor::new(store.clone(), Arc::new(clock.clone()), gauge.clone())
            .with_probe(DownProbe);
        (monitor, store, clock, gauge)
    }

    #[tokio::test]
    async fn snapshot_is_cached_for_fifteen_seconds() {
        let (monitor, _, clock, _) = monitor();
        clock.advance(Duration::from_secs(30));
        let first = monitor.snapshot().await;

        clock.advance(Duration::from_secs(10));
        let second = monitor.snapshot().await;
        let again = monitor.snapshot().await;
        assert_eq!(second, again);
        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(second.uptime_secs, first.uptime_secs);

        clock.advance(Duration::from_secs(6));
        let third = monitor.snapshot().await;
        assert_eq!(first.uptime_secs, 30);
        assert_eq!(third.uptime_secs, 46);
    }

    #[tokio::test]
    async fn failing_probe_reports_disconnected() {
        let (monitor, store, _, _) = monitor();
        store.set_unavailable(true);
        let snapshot = monitor.snapshot().await;

        assert_eq!(
            snapshot.dependencies["database"].status,
            DependencyState::Disconnected
        );
        assert_eq!(
            snapshot.dependencies["redis"].status,
            DependencyState::Disconnected
        );
    }

    #[tokio::test]
    async fn store_probe_carries_info() {
        let (monitor, _, _, _) = monitor();
        let snapshot = monitor.snapshot().await;
        let redis = &snapshot.dependencies["redis"];
        assert_eq!(redis.status, DependencyState::Connected);
        assert_eq!(redis.info.get("backend").map(String::as_str), Some("memory"));
    }

    #[tokio::test]
    async fn malformed_cache_is_recomputed() {
        let (monitor, store, _, _) = monitor();
        store
            .set_with_ttl(&snapshot_key(), "not json", SNAPSHOT_TTL)
            .await
            .unwrap();
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot.uptime_secs, 0);
    }

    #[test]
    fn guard_pairs_open_and_close() {
        let gauge = Arc::new(ConnectionGauge::new());
        let a = gauge.track();
        let b = gauge.track();
        assert_eq!(gauge.current(), 2);
        drop(a);
        assert_eq!(gauge.current(), 1);
        drop(b);
        assert_eq!(gauge.current(), 0);
    }
}

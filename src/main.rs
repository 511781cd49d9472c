use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_redis_monitor::clock::SystemClock;
use rust_redis_monitor::config::Config;
use rust_redis_monitor::store::{CounterStore, MemoryStore, RedisStore};
use rust_redis_monitor::{server, AppState};

/// How long shutdown waits for the telemetry queue to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn")),
        )
        .init();

    // ── 1. Configuration ─────────────────────────────────────────
    let config = Config::from_env().expect("invalid configuration");
    let clock = Arc::new(SystemClock);

    // ── 2. Connect to the store ──────────────────────────────────
    let store: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => {
            info!("connecting to redis");
            let store = RedisStore::connect(url, config.store_timeout)
                .await
                .expect("failed to connect to redis");
            info!("redis connected");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, using in-process memory store");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    // ── 3. Build shared state ────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let (state, worker) =
        AppState::new(config, store, clock).expect("invalid rate limit configuration");

    // ── 4. Build Axum router ─────────────────────────────────────
    let shutdown = state.shutdown.clone();
    let app = server::create_router(state);

    // ── 5. Bind & serve ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind to {bind_addr}: {err}"));

    info!(addr = %bind_addr, "monitoring API listening on /api/monitoring");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown.trigger();
    })
    .await
    .expect("server exited with error");

    // ── 6. Drain telemetry ───────────────────────────────────────
    // The router (and with it the last Recorder) is gone once serve returns.
    match tokio::time::timeout(DRAIN_TIMEOUT, worker).await {
        Ok(Ok(())) => info!("telemetry drained, bye"),
        Ok(Err(err)) => warn!(error = %err, "telemetry worker panicked"),
        Err(_) => warn!("telemetry drain timed out"),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    routing::post,
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use rust_redis_monitor::clock::{Clock, MockClock};
use rust_redis_monitor::config::{Config, Environment};
use rust_redis_monitor::metrics::{RequestMetric, SortBy};
use rust_redis_monitor::middleware::rate_limit::rate_limit;
use rust_redis_monitor::store::MemoryStore;
use rust_redis_monitor::{server, AppState};

struct Harness {
    app: Router,
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    clock: MockClock,
}

fn harness(config: Config) -> Harness {
    let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 10, 30, 0).unwrap());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let (state, _worker) = AppState::new(config, store.clone(), Arc::new(clock.clone())).unwrap();
    Harness {
        app: server::create_router(state.clone()),
        state,
        store,
        clock,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap()
}

async fn json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn overview_is_wrapped_in_success_envelope() {
    let h = harness(Config::default());
    let response = h.app.oneshot(get("/api/monitoring/overview")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("server-timing"));

    let body = json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["api"]["requests_today"], 0);
    assert!(body["data"]["system"]["dependencies"]["redis"].is_object());
}

#[tokio::test]
async fn api_metrics_reports_error_rate() {
    let h = harness(Config::default());
    for status in [200u16, 200, 200, 500] {
        h.state
            .aggregator
            .record_request(&RequestMetric {
                endpoint: "/api/jobs".into(),
                method: "GET".into(),
                status_code: status,
                duration_ms: 12,
                timestamp: h.clock.now(),
                request_id: "req".into(),
                user_id: None,
                error: None,
            })
            .await;
    }

    let body = json(h.app.oneshot(get("/api/monitoring/api-metrics")).await.unwrap()).await;
    assert_eq!(body["data"]["requests_today"], 4);
    assert_eq!(body["data"]["errors_today"], 1);
    assert_eq!(body["data"]["error_rate"], 25.0);
}

#[tokio::test]
async fn invalid_date_is_a_bad_request() {
    let h = harness(Config::default());
    let response = h
        .app
        .oneshot(get("/api/monitoring/errors/by-type?date=16-10-2026"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn general_limiter_answers_429_with_headers() {
    let h = harness(Config {
        rate_limit_window: Duration::from_millis(1000),
        rate_limit_max: 2,
        ..Config::default()
    });

    for _ in 0..2 {
        let ok = h.app.clone().oneshot(get("/api/monitoring/errors/types")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }
    let denied = h.app.clone().oneshot(get("/api/monitoring/errors/types")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["ratelimit-limit"], "2");
    assert_eq!(denied.headers()["ratelimit-remaining"], "0");
    assert_eq!(denied.headers()["retry-after"], "1");
    let body = json(denied).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");

    // /health sits outside the limited tree
    let health = h.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    h.clock.advance(Duration::from_millis(1001));
    let fresh = h.app.oneshot(get("/api/monitoring/errors/types")).await.unwrap();
    assert_eq!(fresh.status(), StatusCode::OK);
}

#[tokio::test]
async fn store_outage_redacts_detail_in_production() {
    let prod = harness(Config {
        environment: Environment::Production,
        ..Config::default()
    });
    prod.store.set_unavailable(true);
    let response = prod.app.oneshot(get("/api/monitoring/endpoints")).await.unwrap();
    // limiter fails open, the read itself fails
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json(response).await;
    assert_eq!(body["error"]["message"], "Internal server error");

    let dev = harness(Config::default());
    dev.store.set_unavailable(true);
    let body = json(dev.app.oneshot(get("/api/monitoring/endpoints")).await.unwrap()).await;
    assert_ne!(body["error"]["message"], "Internal server error");

    // composite overview degrades instead of failing
    let overview = harness(Config::default());
    overview.store.set_unavailable(true);
    let response = overview.app.oneshot(get("/api/monitoring/overview")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["data"]["top_endpoints"], Value::Array(vec![]));
}

#[tokio::test]
async fn requests_are_recorded_by_matched_route() {
    let h = harness(Config::default());
    let request = Request::builder()
        .uri("/api/monitoring/queries?limit=5")
        .header("x-request-id", "req-abc")
        .body(Body::empty())
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-abc");

    let mut recorded = Vec::new();
    for _ in 0..100 {
        recorded = h.state.aggregator.endpoint_stats(10, SortBy::Count).await.unwrap();
        if !recorded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].endpoint, "GET /api/monitoring/queries");
    assert_eq!(recorded[0].calls, 1);
}

#[tokio::test]
async fn successful_requests_are_not_counted_by_auth_limiter() {
    let h = harness(Config::default());
    let login = Router::new()
        .route(
            "/login",
            post(|body: String| async move {
                if body == "right" {
                    StatusCode::OK
                } else {
                    StatusCode::UNAUTHORIZED
                }
            }),
        )
        .route_layer(from_fn_with_state(h.state.limiters.auth.clone(), rate_limit));

    let attempt = |password: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::from(password))
            .unwrap()
    };

    for _ in 0..10 {
        let ok = login.clone().oneshot(attempt("right")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }
    for _ in 0..5 {
        let failed = login.clone().oneshot(attempt("wrong")).await.unwrap();
        assert_eq!(failed.status(), StatusCode::UNAUTHORIZED);
    }
    let blocked = login.oneshot(attempt("right")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn overview_stream_ends_on_shutdown() {
    let h = harness(Config::default());
    let response = h.app.oneshot(get("/api/monitoring/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    h.state.shutdown.trigger();
    assert!(h.state.shutdown.is_triggered());

    let closed = tokio::time::timeout(
        Duration::from_secs(2),
        to_bytes(response.into_body(), usize::MAX),
    )
    .await;
    assert!(matches!(closed, Ok(Ok(_))), "stream should close after shutdown");
}

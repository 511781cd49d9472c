//! Fixed-window rate limiting on top of the shared counter store.
//!
//! Each key gets a counter at `prefix:key`. The first hit of a window creates
//! the counter and gives it a TTL of one window; the counter is never
//! refreshed, so the window resets wholesale when the key expires.
//!
//! The TTL is attached lazily after the increment. Under heavy concurrency a
//! freshly created key can briefly exist without an expiry; the count-based
//! denial still holds in that gap.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::CounterStore;

/// Window and threshold of one deployed limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub prefix: String,
    pub window: Duration,
    pub max: u64,
    /// Compensate hits whose response status is below 400.
    pub skip_successful_requests: bool,
    pub message: String,
}

impl RateLimitConfig {
    /// Validates the tuple; a zero window or threshold is a configuration error.
    pub fn new(prefix: impl Into<String>, window: Duration, max: u64) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(Error::Configuration("rate limit prefix must not be empty".into()));
        }
        if window.is_zero() {
            return Err(Error::Configuration(format!("{prefix}: window must be positive")));
        }
        if max == 0 {
            return Err(Error::Configuration(format!("{prefix}: max must be at least 1")));
        }
        Ok(Self {
            prefix,
            window,
            max,
            skip_successful_requests: false,
            message: "Too many requests, please try again later.".into(),
        })
    }

    pub fn skip_successful_requests(mut self) -> Self {
        self.skip_successful_requests = true;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Outcome of one [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub total_hits: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.config.prefix)
    }

    /// Count one hit against `key`.
    ///
    /// Fails open: if the store is unavailable or times out, the hit is
    /// treated as the first of a fresh window and allowed.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let store_key = self.key(key);
        let now = self.clock.now();
        let window = self.config.window;

        let (total_hits, ttl) = match self.store.incr_with_ttl(&store_key).await {
            Ok((hits, ttl)) => (hits.max(0) as u64, ttl),
            Err(err) => {
                warn!(error = %err, key = %store_key, "rate limit store failed, allowing request");
                return self.decision(1, now + window_delta(window));
            }
        };

        let remaining_ttl = match ttl {
            Some(ttl) => ttl,
            None => {
                if let Err(err) = self.store.expire(&store_key, window).await {
                    warn!(error = %err, key = %store_key, "failed to set rate limit window");
                }
                window
            }
        };

        let decision = self.decision(total_hits, now + window_delta(remaining_ttl));
        if !decision.allowed {
            debug!(key = %store_key, hits = total_hits, "rate limit exceeded");
        }
        decision
    }

    fn decision(&self, total_hits: u64, reset_at: DateTime<Utc>) -> RateLimitDecision {
        RateLimitDecision {
            allowed: total_hits <= self.config.max,
            total_hits,
            limit: self.config.max,
            remaining: self.config.max.saturating_sub(total_hits),
            reset_at,
        }
    }

    /// Give back one hit, e.g. for a request that should not count.
    /// A window that has already expired is left alone.
    pub async fn decrement(&self, key: &str) {
        let store_key = self.key(key);
        match self.store.decr_existing(&store_key).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(key = %store_key, "rate limit window gone, nothing to give back"),
            Err(err) => {
                warn!(error = %err, key = %store_key, "failed to decrement rate limit counter")
            }
        }
    }

    /// Drop the window for `key` entirely.
    pub async fn reset_key(&self, key: &str) {
        let store_key = self.key(key);
        if let Err(err) = self.store.delete(&store_key).await {
            warn!(error = %err, key = %store_key, "failed to reset rate limit key");
        }
    }
}

fn window_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

// ─── Deployed limiters ───────────────────────────────────────────

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// The limiters installed by the service. Each one owns an independent
/// key space under `rl:`.
#[derive(Debug, Clone)]
pub struct Limiters {
    pub general: RateLimiter,
    pub auth: RateLimiter,
    pub register: RateLimiter,
    pub verify: RateLimiter,
    pub forgot_password: RateLimiter,
}

impl Limiters {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let build = |cfg: RateLimitConfig| RateLimiter::new(store.clone(), clock.clone(), cfg);

        Ok(Self {
            general: build(RateLimitConfig::new(
                "rl:general",
                config.rate_limit_window,
                config.rate_limit_max,
            )?),
            auth: build(
                RateLimitConfig::new("rl:auth", 15 * MINUTE, 5)?
                    .skip_successful_requests()
                    .with_message("Too many login attempts, please try again later."),
            ),
            register: build(
                RateLimitConfig::new("rl:register", HOUR, 3)?
                    .with_message("Too many accounts created, please try again later."),
            ),
            verify: build(
                RateLimitConfig::new("rl:verify", 15 * MINUTE, 10)?
                    .with_message("Too many verification attempts, please try again later."),
            ),
            forgot_password: build(
                RateLimitConfig::new("rl:forgot", HOUR, 3)?
                    .with_message("Too many password reset requests, please try again later."),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn limiter(window_ms: u64, max: u64) -> (RateLimiter, Arc<MemoryStore>, MockClock) {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let config =
            RateLimitConfig::new("rl:test", Duration::from_millis(window_ms), max).unwrap();
        (
            RateLimiter::new(store.clone(), Arc::new(clock.clone()), config),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn fixed_window_allows_then_denies_then_resets() {
        let (limiter, _, clock) = limiter(1000, 3);
        let start = clock.now();

        for n in 1..=3 {
            let d = limiter.check("10.0.0.1").await;
            assert!(d.allowed, "request {n} should pass");
            assert_eq!(d.total_hits, n);
        }
        let denied = limiter.check("10.0.0.1").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, start + chrono::Duration::milliseconds(1000));

        clock.advance(Duration::from_millis(1001));
        let fresh = limiter.check("10.0.0.1").await;
        assert!(fresh.allowed);
        assert_eq!(fresh.total_hits, 1);
    }

    #[tokio::test]
    async fn window_is_not_extended_by_later_hits() {
        let (limiter, store, clock) = limiter(1000, 10);
        limiter.check("k").await;
        clock.advance(Duration::from_millis(600));
        let d = limiter.check("k").await;

        assert_eq!(store.ttl("rl:test:k"), Some(Duration::from_millis(400)));
        assert_eq!(d.reset_at, clock.now() + chrono::Duration::milliseconds(400));
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let (limiter, store, _) = limiter(1000, 1);
        store.set_unavailable(true);
        for _ in 0..5 {
            let d = limiter.check("k").await;
            assert!(d.allowed);
            assert_eq!(d.total_hits, 1);
        }
    }

    #[tokio::test]
    async fn decrement_and_reset() {
        let (limiter, _, _) = limiter(60_000, 2);
        limiter.check("k").await;
        limiter.check("k").await;
        limiter.decrement("k").await;
        assert!(limiter.check("k").await.allowed);
        assert!(!limiter.check("k").await.allowed);

        limiter.reset_key("k").await;
        assert_eq!(limiter.check("k").await.total_hits, 1);
    }

    #[tokio::test]
    async fn decrement_after_expiry_does_not_revive_the_key() {
        let (limiter, store, clock) = limiter(1000, 3);
        limiter.check("k").await;
        clock.advance(Duration::from_millis(1500));
        limiter.decrement("k").await;

        assert_eq!(store.get("rl:test:k").await.unwrap(), None);
        assert_eq!(store.ttl("rl:test:k"), None);

        let next = limiter.check("k").await;
        assert_eq!(next.total_hits, 1);
        assert_eq!(store.ttl("rl:test:k"), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn invalid_tuples_are_rejected() {
        assert!(matches!(
            RateLimitConfig::new("rl:x", Duration::ZERO, 5),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            RateLimitConfig::new("rl:x", Duration::from_secs(1), 0),
            Err(Error::Configuration(_))
        ));
        assert!(RateLimitConfig::new("", Duration::from_secs(1), 1).is_err());
    }

    #[tokio::test]
    async fn deployed_limiters_have_independent_key_spaces() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap());
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiters = Limiters::from_config(&Config::default(), store, Arc::new(clock)).unwrap();

        for _ in 0..3 {
            assert!(limiters.register.check("1.2.3.4").await.allowed);
        }
        assert!(!limiters.register.check("1.2.3.4").await.allowed);
        assert!(limiters.forgot_password.check("1.2.3.4").await.allowed);
        assert_eq!(limiters.general.check("1.2.3.4").await.total_hits, 1);
        assert!(limiters.auth.config().skip_successful_requests);
    }
}

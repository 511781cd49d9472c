//! Window key scheme.
//!
//! Every persisted key is derived from `(namespace, dimension, granularity,
//! bucket)` so keys are self-describing and expire on their own:
//!
//! ```text
//!   monitoring:requests:daily:2026-10-16
//!   monitoring:requests:hourly:2026-10-16:13
//!   rl:general:203.0.113.7
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::time::Duration;

// ─── Namespaces ──────────────────────────────────────────────────

pub const MONITORING: &str = "monitoring";

// ─── Retention ───────────────────────────────────────────────────

/// Daily request/error totals.
pub const DAILY_TOTAL_TTL: Duration = Duration::from_secs(2 * 24 * 3600);
/// Response-time samples and query stats.
pub const SAMPLE_TTL: Duration = Duration::from_secs(3600);
/// Type, hourly and per-endpoint breakdowns.
pub const BREAKDOWN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

// ─── Caps ────────────────────────────────────────────────────────

/// Length of every bounded duration sample.
pub const SAMPLE_CAP: usize = 100;
/// Length of the recent-error list.
pub const RECENT_ERRORS_CAP: usize = 100;
/// Length of the slow query log.
pub const SLOW_QUERY_CAP: usize = 100;

// ─── Granularity ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hourly",
            Self::Day => "daily",
        }
    }

    /// Calendar bucket containing `ts`.
    pub fn bucket(self, ts: DateTime<Utc>) -> String {
        match self {
            Self::Hour => ts.format("%Y-%m-%d:%H").to_string(),
            Self::Day => ts.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Label for an explicit calendar day (used by trend reads).
pub fn day_label(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Label for hour `hour` of `date`.
pub fn hour_label(date: NaiveDate, hour: u32) -> String {
    format!("{}:{hour:02}", day_label(date))
}

// ─── WindowKey ───────────────────────────────────────────────────

/// A fully-qualified windowed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKey {
    namespace: &'static str,
    dimension: String,
    granularity: Granularity,
    bucket: String,
}

impl WindowKey {
    pub fn new(
        namespace: &'static str,
        dimension: impl Into<String>,
        granularity: Granularity,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            namespace,
            dimension: dimension.into(),
            granularity,
            bucket: bucket.into(),
        }
    }

    /// Key for the bucket of `granularity` that contains `ts`.
    pub fn at(
        namespace: &'static str,
        dimension: impl Into<String>,
        granularity: Granularity,
        ts: DateTime<Utc>,
    ) -> Self {
        Self::new(namespace, dimension, granularity, granularity.bucket(ts))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.namespace,
            self.dimension,
            self.granularity.as_str(),
            self.bucket
        )
    }
}

impl From<WindowKey> for String {
    fn from(key: WindowKey) -> Self {
        key.to_string()
    }
}

/// Non-windowed key under the monitoring namespace, e.g.
/// `monitoring:response_times:GET /api/users/:id`.
pub fn monitoring_key(parts: &[&str]) -> String {
    let mut key = String::from(MONITORING);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn buckets_are_derived_from_utc_timestamp() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 16, 7, 45, 12).unwrap();
        assert_eq!(Granularity::Day.bucket(ts), "2026-10-16");
        assert_eq!(Granularity::Hour.bucket(ts), "2026-10-16:07");
    }

    #[test]
    fn window_key_format() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 23, 0, 0).unwrap();
        let key = WindowKey::at(MONITORING, "requests", Granularity::Hour, ts);
        assert_eq!(key.to_string(), "monitoring:requests:hourly:2026-01-02:23");
        assert_eq!(key.bucket(), "2026-01-02:23");

        let date = ts.date_naive();
        assert_eq!(hour_label(date, 5), "2026-01-02:05");
        assert_eq!(
            WindowKey::new(MONITORING, "errors", Granularity::Day, day_label(date))
                .to_string(),
            "monitoring:errors:daily:2026-01-02"
        );
    }

    #[test]
    fn plain_monitoring_keys() {
        assert_eq!(
            monitoring_key(&["response_times", "GET /health"]),
            "monitoring:response_times:GET /health"
        );
    }
}

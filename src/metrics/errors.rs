use chrono::{Days, NaiveDate, Timelike};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;
use uuid::Uuid;

use super::collector::{window_key, MetricsAggregator};
use super::{endpoint_dimension, ErrorEvent, ErrorRecord};
use crate::error::{Error, StoreResult};
use crate::keys::{
    day_label, hour_label, monitoring_key, Granularity, BREAKDOWN_TTL, RECENT_ERRORS_CAP,
};
use crate::store::Batch;

/// Longest trend the read API will compute.
pub const MAX_TREND_DAYS: u32 = 30;

const TYPES: &str = "exceptions:types";
const HOURLY: &str = "exceptions";
const ENDPOINTS: &str = "exceptions:endpoints";

fn recent_key() -> String {
    monitoring_key(&["exceptions", "recent"])
}

fn types_key(date: NaiveDate) -> String {
    window_key(TYPES, Granularity::Day, day_label(date))
}

fn endpoints_key(date: NaiveDate) -> String {
    window_key(ENDPOINTS, Granularity::Day, day_label(date))
}

fn hourly_key(date: NaiveDate, hour: u32) -> String {
    window_key(HOURLY, Granularity::Hour, hour_label(date, hour))
}

/// Error totals for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorTrend {
    pub date: String,
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// Full breakdown of one day's errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBreakdown {
    pub date: String,
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_endpoint: BTreeMap<String, u64>,
    /// 24 entries, index = hour of day
    pub by_hour: Vec<u64>,
}

impl MetricsAggregator {
    /// Store an error in the recency list and bump its breakdown counters.
    /// Store failures are logged and swallowed.
    pub async fn record_error(&self, event: &ErrorEvent) {
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            error_type: event.error_type.clone(),
            code: event.code.clone(),
            message: event.message.clone(),
            stack: event.stack.clone(),
            endpoint: event.endpoint.clone(),
            method: event.method.clone(),
            status_code: event.status_code,
            timestamp: event.timestamp,
            request_id: event.request_id.clone(),
            user_id: event.user_id.clone(),
            metadata: event.metadata.clone(),
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "could not serialize error record");
                return;
            }
        };

        let date = event.timestamp.date_naive();
        let recent = recent_key();
        let types = types_key(date);
        let hourly = hourly_key(date, event.timestamp.hour());
        let endpoints = endpoints_key(date);

        let mut batch = Batch::new();
        batch
            .push_capped(&recent, json, RECENT_ERRORS_CAP)
            .expire_once(recent, BREAKDOWN_TTL)
            .hash_incr(&types, &event.error_type, 1)
            .expire_once(types, BREAKDOWN_TTL)
            .incr(&hourly, 1)
            .expire_once(hourly, BREAKDOWN_TTL)
            .hash_incr(
                &endpoints,
                endpoint_dimension(&event.method, &event.endpoint),
                1,
            )
            .expire_once(endpoints, BREAKDOWN_TTL);

        if let Err(err) = self.store.exec(batch).await {
            warn!(error = %err, error_type = %event.error_type, "failed to record error");
        }
    }

    /// Newest-first errors, optionally restricted to one type.
    pub async fn recent_errors(
        &self,
        limit: usize,
        type_filter: Option<&str>,
    ) -> StoreResult<Vec<ErrorRecord>> {
        let key = recent_key();
        let raw = self.store.list(&key, RECENT_ERRORS_CAP).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| parse_record(&key, entry))
            .filter(|record| type_filter.map_or(true, |t| record.error_type == t))
            .take(limit)
            .collect())
    }

    /// Distinct error types present in the recency list.
    pub async fn error_types(&self) -> StoreResult<Vec<String>> {
        let types: BTreeSet<String> = self
            .recent_errors(RECENT_ERRORS_CAP, None)
            .await?
            .into_iter()
            .map(|record| record.error_type)
            .collect();
        Ok(types.into_iter().collect())
    }

    /// One entry per each of the last `days` days, oldest first, zero-filled.
    pub async fn error_trends(&self, days: u32) -> StoreResult<Vec<ErrorTrend>> {
        let today = self.today();
        let days = days.clamp(1, MAX_TREND_DAYS);

        let mut trends = Vec::with_capacity(days as usize);
        for offset in (0..days).rev() {
            let Some(date) = today.checked_sub_days(Days::new(offset.into())) else {
                continue;
            };
            let key = types_key(date);
            let by_type = counts(self.store.hash(&key).await?, &key);
            trends.push(ErrorTrend {
                date: day_label(date),
                total: by_type.values().sum(),
                by_type,
            });
        }
        Ok(trends)
    }

    /// Type, endpoint and hourly breakdown for `date` (today when `None`).
    pub async fn errors_by_type(&self, date: Option<NaiveDate>) -> StoreResult<ErrorBreakdown> {
        let date = date.unwrap_or_else(|| self.today());

        let types = types_key(date);
        let by_type = counts(self.store.hash(&types).await?, &types);
        let endpoints = endpoints_key(date);
        let by_endpoint = counts(self.store.hash(&endpoints).await?, &endpoints);
        let hour_keys: Vec<String> = (0..24).map(|h| hourly_key(date, h)).collect();
        let by_hour = self
            .store
            .counters(&hour_keys)
            .await?
            .into_iter()
            .map(|n| n.max(0) as u64)
            .collect();

        Ok(ErrorBreakdown {
            date: day_label(date),
            total: by_type.values().sum(),
            by_type,
            by_endpoint,
            by_hour,
        })
    }
}

fn parse_record(key: &str, raw: &str) -> Option<ErrorRecord> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(err) => {
            let err = Error::MalformedValue {
                key: key.to_owned(),
                reason: err.to_string(),
            };
            warn!(error = %err, "skipping error record");
            None
        }
    }
}

/// Hash of integer counters → ordered map; malformed fields are dropped.
fn counts(raw: HashMap<String, String>, key: &str) -> BTreeMap<String, u64> {
    raw.into_iter()
        .filter_map(|(field, value)| match value.parse::<u64>() {
            Ok(n) => Some((field, n)),
            Err(_) => {
                warn!(key, field = %field, "ignoring malformed counter field");
                None
            }
        })
        .collect()
}

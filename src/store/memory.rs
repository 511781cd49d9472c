//! In-process [`CounterStore`].
//!
//! Mirrors the Redis semantics the engine relies on (atomic batches, capped
//! lists, set-once expiry, lazy expiry on access) behind a single mutex, so the
//! whole engine can run without Redis. Time comes from the injected [`Clock`],
//! which lets tests expire keys by advancing a `MockClock`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{parse_counter, Batch, CounterStore, Op};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Ranked(HashMap<String, f64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Remaining TTL of `key`, if it exists and carries an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        live(&mut entries, key, now)
            .and_then(|e| e.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

// ─── Entry helpers ───────────────────────────────────────────────

fn evict_expired(entries: &mut HashMap<String, Entry>, key: &str, now: DateTime<Utc>) {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        entries.remove(key);
    }
}

/// Returns the entry for `key`, evicting it first if it has expired.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    evict_expired(entries, key, now);
    entries.get_mut(key)
}

fn live_or_insert<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
    init: fn() -> Value,
) -> &'a mut Entry {
    evict_expired(entries, key, now);
    entries.entry(key.to_owned()).or_insert_with(|| Entry {
        value: init(),
        expires_at: None,
    })
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_owned())
}

fn incr_str(entry: &mut Entry, key: &str, by: i64) -> StoreResult<i64> {
    match &mut entry.value {
        Value::Str(raw) => {
            let current: i64 = raw.parse().map_err(|_| wrong_type(key))?;
            let next = current + by;
            *raw = next.to_string();
            Ok(next)
        }
        _ => Err(wrong_type(key)),
    }
}

fn ttl_duration(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}

fn is_integer(raw: &str) -> bool {
    raw.parse::<i64>().is_ok()
}

fn op_key(op: &Op) -> &str {
    match op {
        Op::Incr { key, .. }
        | Op::HashIncr { key, .. }
        | Op::HashSet { key, .. }
        | Op::RankIncr { key, .. }
        | Op::PushCapped { key, .. }
        | Op::ExpireOnce { key, .. } => key,
    }
}

/// Whether `op` can be applied to an existing `value`.
fn fits(value: &Value, op: &Op) -> bool {
    match (op, value) {
        (Op::Incr { .. }, Value::Str(raw)) => is_integer(raw),
        (Op::HashIncr { field, .. }, Value::Hash(map)) => {
            map.get(field).map_or(true, |raw| is_integer(raw))
        }
        (Op::HashSet { .. }, Value::Hash(_)) => true,
        (Op::RankIncr { .. }, Value::Ranked(_)) => true,
        (Op::PushCapped { .. }, Value::List(_)) => true,
        (Op::ExpireOnce { .. }, _) => true,
        _ => false,
    }
}

/// Type-check `op` against the current state before anything is written.
fn check_op(
    entries: &mut HashMap<String, Entry>,
    op: &Op,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let key = op_key(op);
    match live(entries, key, now) {
        Some(entry) if !fits(&entry.value, op) => Err(wrong_type(key)),
        _ => Ok(()),
    }
}

fn apply(
    entries: &mut HashMap<String, Entry>,
    op: &Op,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    match op {
        Op::Incr { key, by } => {
            let entry = live_or_insert(entries, key, now, || Value::Str("0".into()));
            incr_str(entry, key, *by)?;
        }
        Op::HashIncr { key, field, by } => {
            let entry = live_or_insert(entries, key, now, || Value::Hash(HashMap::new()));
            let Value::Hash(map) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let slot = map.entry(field.clone()).or_insert_with(|| "0".into());
            let current: i64 = slot.parse().map_err(|_| wrong_type(key))?;
            *slot = (current + by).to_string();
        }
        Op::HashSet { key, field, value } => {
            let entry = live_or_insert(entries, key, now, || Value::Hash(HashMap::new()));
            let Value::Hash(map) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            map.insert(field.clone(), value.clone());
        }
        Op::RankIncr { key, member, by } => {
            let entry = live_or_insert(entries, key, now, || Value::Ranked(HashMap::new()));
            let Value::Ranked(set) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            *set.entry(member.clone()).or_insert(0.0) += by;
        }
        Op::PushCapped { key, value, cap } => {
            let entry = live_or_insert(entries, key, now, || Value::List(VecDeque::new()));
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            list.push_front(value.clone());
            list.truncate(*cap);
        }
        Op::ExpireOnce { key, ttl } => {
            if let Some(entry) = live(entries, key, now) {
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(now + ttl_duration(*ttl));
                }
            }
        }
    }
    Ok(())
}

// ─── CounterStore impl ───────────────────────────────────────────

#[async_trait]
impl CounterStore for MemoryStore {
    async fn exec(&self, batch: Batch) -> StoreResult<()> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        // Type-check every op up front so a bad op leaves no partial writes.
        for op in batch.ops() {
            check_op(&mut entries, op, now)?;
        }
        for op in batch.ops() {
            apply(&mut entries, op, now)?;
        }
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str) -> StoreResult<(i64, Option<Duration>)> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = live_or_insert(&mut entries, key, now, || Value::Str("0".into()));
        let hits = incr_str(entry, key, 1)?;
        let ttl = entry
            .expires_at
            .and_then(|at| (at - now).to_std().ok());
        Ok((hits, ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if let Some(entry) = live(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl_duration(ttl));
        }
        Ok(())
    }

    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            Some(entry) => incr_str(entry, key, -1).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(raw),
                ..
            }) => Ok(Some(raw.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        let now = self.clock.now();
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                expires_at: Some(now + ttl_duration(ttl)),
            },
        );
        Ok(())
    }

    async fn counters(&self, keys: &[String]) -> StoreResult<Vec<i64>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Ok(keys
            .iter()
            .map(|key| match live(&mut entries, key, now) {
                Some(Entry {
                    value: Value::Str(raw),
                    ..
                }) => parse_counter(key, Some(raw.as_str())),
                // MGET reports non-strings as nil
                _ => 0,
            })
            .collect())
    }

    async fn hash(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().take(limit).cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lists(&self, keys: &[String], limit: usize) -> StoreResult<Vec<Vec<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.list(key, limit).await?);
        }
        Ok(out)
    }

    async fn ranked(&self, key: &str, limit: Option<usize>) -> StoreResult<Vec<(String, f64)>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let set = match live(&mut entries, key, now) {
            None => return Ok(Vec::new()),
            Some(Entry {
                value: Value::Ranked(set),
                ..
            }) => set,
            Some(_) => return Err(wrong_type(key)),
        };

        let mut members: Vec<(String, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        // ZREVRANGE: score desc, ties by member desc
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        if let Some(n) = limit {
            members.truncate(n);
        }
        Ok(members)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn info(&self) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        let keys = self.entries.lock().len();
        Ok(HashMap::from([
            ("backend".to_owned(), "memory".to_owned()),
            ("keys".to_owned(), keys.to_string()),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::TimeZone;

    fn store() -> (MemoryStore, MockClock) {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn capped_list_keeps_most_recent() {
        let (store, _) = store();
        for i in 0..150 {
            let mut batch = Batch::new();
            batch.push_capped("samples", i.to_string(), 100);
            store.exec(batch).await.unwrap();
        }

        let all = store.list("samples", 1000).await.unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(all.first().map(String::as_str), Some("149"));
        assert_eq!(all.last().map(String::as_str), Some("50"));
    }

    #[tokio::test]
    async fn expire_once_is_never_refreshed() {
        let (store, clock) = store();
        let mut batch = Batch::new();
        batch.incr("c", 1).expire_once("c", Duration::from_secs(60));
        store.exec(batch).await.unwrap();

        clock.advance(Duration::from_secs(40));
        let mut batch = Batch::new();
        batch.incr("c", 1).expire_once("c", Duration::from_secs(60));
        store.exec(batch).await.unwrap();
        assert_eq!(store.ttl("c"), Some(Duration::from_secs(20)));

        clock.advance(Duration::from_secs(20));
        assert_eq!(store.counters(&["c".into()]).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn failing_batch_leaves_no_partial_writes() {
        let (store, _) = store();
        let mut batch = Batch::new();
        batch.push_capped("list", "x", 10);
        store.exec(batch).await.unwrap();

        let mut batch = Batch::new();
        batch.incr("fresh", 1).incr("list", 1);
        assert!(matches!(
            store.exec(batch).await,
            Err(StoreError::WrongType(_))
        ));
        assert_eq!(store.get("fresh").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_with_ttl_reports_missing_expiry() {
        let (store, clock) = store();
        assert_eq!(store.incr_with_ttl("rl:k").await.unwrap(), (1, None));

        store.expire("rl:k", Duration::from_millis(1000)).await.unwrap();
        clock.advance(Duration::from_millis(400));
        assert_eq!(
            store.incr_with_ttl("rl:k").await.unwrap(),
            (2, Some(Duration::from_millis(600)))
        );
    }

    #[tokio::test]
    async fn ranked_orders_by_score() {
        let (store, _) = store();
        let mut batch = Batch::new();
        batch
            .rank_incr("z", "a", 1.0)
            .rank_incr("z", "b", 3.0)
            .rank_incr("z", "c", 2.0);
        store.exec(batch).await.unwrap();

        let top = store.ranked("z", Some(2)).await.unwrap();
        assert_eq!(top, vec![("b".to_owned(), 3.0), ("c".to_owned(), 2.0)]);
    }

    #[tokio::test]
    async fn outage_switch() {
        let (store, _) = store();
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}

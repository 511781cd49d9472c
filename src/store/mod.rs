//! Counter store adapter.
//!
//! A thin async interface over the shared key-value store. All coordination
//! between writers is delegated to the store's own atomicity: writes for one
//! logical event are collected in a [`Batch`] and executed as a single atomic
//! round trip.

pub mod memory;
pub mod redis_client;

pub use self::memory::MemoryStore;
pub use self::redis_client::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::StoreResult;

/// One write inside an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// `INCRBY key by`
    Incr { key: String, by: i64 },
    /// `HINCRBY key field by`
    HashIncr { key: String, field: String, by: i64 },
    /// `HSET key field value`
    HashSet { key: String, field: String, value: String },
    /// `ZINCRBY key by member`
    RankIncr { key: String, member: String, by: f64 },
    /// `LPUSH key value` followed by `LTRIM key 0 cap-1`
    PushCapped { key: String, value: String, cap: usize },
    /// `EXPIRE key secs NX`: only applies when the key has no expiry yet.
    ExpireOnce { key: String, ttl: Duration },
}

/// Ordered list of writes executed atomically.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: impl Into<String>, by: i64) -> &mut Self {
        self.ops.push(Op::Incr { key: key.into(), by });
        self
    }

    pub fn hash_incr(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        by: i64,
    ) -> &mut Self {
        self.ops.push(Op::HashIncr {
            key: key.into(),
            field: field.into(),
            by,
        });
        self
    }

    pub fn hash_set(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(Op::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn rank_incr(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        by: f64,
    ) -> &mut Self {
        self.ops.push(Op::RankIncr {
            key: key.into(),
            member: member.into(),
            by,
        });
        self
    }

    pub fn push_capped(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        cap: usize,
    ) -> &mut Self {
        self.ops.push(Op::PushCapped {
            key: key.into(),
            value: value.into(),
            cap,
        });
        self
    }

    pub fn expire_once(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(Op::ExpireOnce {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }
}

/// Async interface implemented by [`RedisStore`] and [`MemoryStore`].
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Execute every op of `batch` atomically.
    async fn exec(&self, batch: Batch) -> StoreResult<()>;

    /// Increment `key` by one and return the new value together with the
    /// remaining TTL (`None` when the key carries no expiry).
    async fn incr_with_ttl(&self, key: &str) -> StoreResult<(i64, Option<Duration>)>;

    /// Unconditionally set the expiry of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Decrement `key` only if it still exists; returns the new value, or
    /// `None` when the key has expired or was never created.
    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Read several integer counters in one round trip. Missing keys read as 0.
    async fn counters(&self, keys: &[String]) -> StoreResult<Vec<i64>>;

    async fn hash(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// First `limit` entries of a list, newest first.
    async fn list(&self, key: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// [`list`](Self::list) for several keys in one round trip.
    async fn lists(&self, keys: &[String], limit: usize) -> StoreResult<Vec<Vec<String>>>;

    /// Members by descending score; `None` returns the whole set.
    async fn ranked(&self, key: &str, limit: Option<usize>) -> StoreResult<Vec<(String, f64)>>;

    async fn ping(&self) -> StoreResult<()>;

    /// Selected server properties (version, clients, memory).
    async fn info(&self) -> StoreResult<HashMap<String, String>>;
}

/// Parse a raw counter value. Malformed values read as zero.
pub(crate) fn parse_counter(key: &str, raw: Option<&str>) -> i64 {
    match raw {
        None => 0,
        Some(v) => v.parse().unwrap_or_else(|_| {
            let err = crate::error::Error::MalformedValue {
                key: key.to_owned(),
                reason: format!("not an integer: {v:?}"),
            };
            tracing::warn!(error = %err, "treating counter as zero");
            0
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_insertion_order() {
        let mut batch = Batch::new();
        batch
            .incr("a", 1)
            .push_capped("l", "5", 100)
            .expire_once("a", Duration::from_secs(60));

        assert_eq!(batch.ops().len(), 3);
        assert!(matches!(batch.ops()[0], Op::Incr { .. }));
        assert!(matches!(batch.ops()[2], Op::ExpireOnce { .. }));
    }

    #[test]
    fn malformed_counter_reads_zero() {
        assert_eq!(parse_counter("k", Some("12")), 12);
        assert_eq!(parse_counter("k", Some("twelve")), 0);
        assert_eq!(parse_counter("k", None), 0);
    }
}

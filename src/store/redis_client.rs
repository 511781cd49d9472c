use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use super::{parse_counter, Batch, CounterStore, Op};
use crate::error::{StoreError, StoreResult};

/// Fields surfaced by [`CounterStore::info`].
const INFO_FIELDS: &[&str] = &[
    "redis_version",
    "uptime_in_seconds",
    "connected_clients",
    "used_memory_human",
];

/// `DECR` that never creates the key, so an expired window is not revived
/// without a TTL.
const DECR_EXISTING: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('DECR', KEYS[1])
end
return false
";

/// Redis-backed [`CounterStore`].
///
/// `ConnectionManager` is cheaply cloneable and auto-reconnects; every clone
/// shares the same multiplexed TCP connection. Each call runs under the
/// store's default operation timeout.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Opens a `ConnectionManager` against `url`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, timeout })
    }

    async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

fn stop_index(limit: usize) -> isize {
    limit as isize - 1
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn exec(&self, batch: Batch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                Op::Incr { key, by } => {
                    pipe.incr(key, *by).ignore();
                }
                Op::HashIncr { key, field, by } => {
                    pipe.hincr(key, field, *by).ignore();
                }
                Op::HashSet { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                Op::RankIncr { key, member, by } => {
                    pipe.zincr(key, member, *by).ignore();
                }
                Op::PushCapped { key, value, cap } => {
                    pipe.lpush(key, value)
                        .ignore()
                        .ltrim(key, 0, stop_index(*cap))
                        .ignore();
                }
                Op::ExpireOnce { key, ttl } => {
                    // Requires Redis >= 7.0 for the NX flag.
                    pipe.cmd("EXPIRE")
                        .arg(key)
                        .arg(ttl.as_secs().max(1))
                        .arg("NX")
                        .ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        self.run(async move { pipe.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn incr_with_ttl(&self, key: &str) -> StoreResult<(i64, Option<Duration>)> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().incr(key, 1).pttl(key);

        let (hits, pttl): (i64, i64) = self
            .run(async move { pipe.query_async(&mut conn).await })
            .await?;

        // PTTL: -1 = no expiry, -2 = no key
        let ttl = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
        Ok((hits, ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl.as_millis() as u64);
        self.run(async move { cmd.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(DECR_EXISTING);
        self.run(async move { script.key(key).invoke_async(&mut conn).await })
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.del(key).await }).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.get(key).await }).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        self.run(async move { cmd.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn counters(&self, keys: &[String]) -> StoreResult<Vec<i64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        let raw: Vec<Option<String>> = self
            .run(async move { cmd.query_async(&mut conn).await })
            .await?;

        Ok(keys
            .iter()
            .zip(raw)
            .map(|(key, value)| parse_counter(key, value.as_deref()))
            .collect())
    }

    async fn hash(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.run(async move { conn.hgetall(key).await }).await
    }

    async fn list(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.run(async move { conn.lrange(key, 0, stop_index(limit)).await })
            .await
    }

    async fn lists(&self, keys: &[String], limit: usize) -> StoreResult<Vec<Vec<String>>> {
        if keys.is_empty() || limit == 0 {
            return Ok(vec![Vec::new(); keys.len()]);
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.lrange(key, 0, stop_index(limit));
        }
        let mut conn = self.conn.clone();
        self.run(async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn ranked(&self, key: &str, limit: Option<usize>) -> StoreResult<Vec<(String, f64)>> {
        let stop = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => stop_index(n),
            None => -1,
        };
        let mut conn = self.conn.clone();
        self.run(async move { conn.zrevrange_withscores(key, 0, stop).await })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let _pong: String = self
            .run(async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn info(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("INFO");
        let raw: String = self
            .run(async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(parse_info(&raw))
    }
}

/// Pick the interesting `field:value` lines out of an `INFO` reply.
fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .filter(|(field, _)| INFO_FIELDS.contains(field))
        .map(|(field, value)| (field.to_owned(), value.trim().to_owned()))
        .collect()
}

//! Redis-backed state store

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script};
use std::collections::HashMap;
use std::time::Duration;

use super::{StateStore, WriteBatch, WriteOp};
use crate::config::RedisConfig;
use crate::{Error, Result};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const INCR_FROM: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    redis.call("SET", KEYS[1], ARGV[1])
end
return redis.call("INCR", KEYS[1])
"#;

/// `StateStore` over a multiplexed Redis connection
///
/// Each call clones the connection manager and is bounded by the configured
/// operation timeout.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStateStore {
    #[must_use]
    pub const fn new(conn: ConnectionManager, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    /// Open a connection manager and verify the server answers
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::StateStore(format!("Invalid Redis URL: {e}")))?;

        let connect_timeout = Duration::from_secs(config.connect_timeout_seconds);
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout(format!("Redis connect exceeded {connect_timeout:?}")))?
            .map_err(|e| Error::StateStore(format!("Failed to connect to Redis: {e}")))?;

        let store = Self::new(conn, Duration::from_secs(config.operation_timeout_seconds));
        store.ping().await?;
        Ok(store)
    }

    async fn query<T: FromRedisValue + Send>(&self, op: &str, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(self.timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Redis {op} exceeded {:?}", self.timeout)))?
            .map_err(|e| Error::StateStore(format!("Redis {op} failed: {e}")))
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn ping(&self) -> Result<()> {
        let _: String = self.query("PING", redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query("GET", redis::cmd("GET").arg(key).clone()).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.query("SET", redis::cmd("SET").arg(key).arg(value).clone())
            .await
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // SET key value NX PX ttl
        let result: Option<String> = self
            .query(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .clone(),
            )
            .await?;
        Ok(result.is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.query(
            "SET PX",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .clone(),
        )
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let script = Script::new(COMPARE_AND_DELETE);
        let mut conn = self.conn.clone();

        let deleted: i32 = tokio::time::timeout(
            self.timeout,
            script.key(key).arg(expected).invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout(format!("Redis compare-and-delete exceeded {:?}", self.timeout)))?
        .map_err(|e| Error::StateStore(format!("Redis compare-and-delete failed: {e}")))?;

        Ok(deleted == 1)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.query("DEL", redis::cmd("DEL").arg(key).clone()).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.query("EXISTS", redis::cmd("EXISTS").arg(key).clone())
            .await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query("HGETALL", redis::cmd("HGETALL").arg(key).clone())
            .await
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let _: i64 = self
            .query("HSET", redis::cmd("HSET").arg(key).arg(fields).clone())
            .await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self
            .query("SADD", redis::cmd("SADD").arg(key).arg(member).clone())
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self
            .query("SREM", redis::cmd("SREM").arg(key).arg(member).clone())
            .await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.query("SMEMBERS", redis::cmd("SMEMBERS").arg(key).clone())
            .await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.query(
            "SISMEMBER",
            redis::cmd("SISMEMBER").arg(key).arg(member).clone(),
        )
        .await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.query("SCARD", redis::cmd("SCARD").arg(key).clone())
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = self
            .query(
                "ZADD",
                redis::cmd("ZADD").arg(key).arg(score).arg(member).clone(),
            )
            .await?;
        Ok(())
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.query(
            "ZINCRBY",
            redis::cmd("ZINCRBY").arg(key).arg(delta).arg(member).clone(),
        )
        .await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.query("ZSCORE", redis::cmd("ZSCORE").arg(key).arg(member).clone())
            .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self
            .query("ZREM", redis::cmd("ZREM").arg(key).arg(member).clone())
            .await?;
        Ok(removed > 0)
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.query(
            "ZRANGE",
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .clone(),
        )
        .await
    }

    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>> {
        self.query(
            "ZRANGEBYSCORE",
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max)
                .clone(),
        )
        .await
    }

    async fn incr_from(&self, key: &str, initial: i64) -> Result<i64> {
        let script = Script::new(INCR_FROM);
        let mut conn = self.conn.clone();

        tokio::time::timeout(
            self.timeout,
            script.key(key).arg(initial).invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout(format!("Redis INCR exceeded {:?}", self.timeout)))?
        .map_err(|e| Error::StateStore(format!("Redis INCR on {key} failed: {e}")))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.query(
            "PUBLISH",
            redis::cmd("PUBLISH").arg(channel).arg(payload).clone(),
        )
        .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                WriteOp::Set { key, value } => pipe.set(key, value).ignore(),
                WriteOp::Del { key } => pipe.del(key).ignore(),
                WriteOp::HSet { key, fields } => pipe.hset_multiple(key, fields.as_slice()).ignore(),
                WriteOp::SAdd { key, member } => pipe.sadd(key, member).ignore(),
                WriteOp::SRem { key, member } => pipe.srem(key, member).ignore(),
                WriteOp::ZAdd { key, member, score } => pipe.zadd(key, member, *score).ignore(),
                WriteOp::ZRem { key, member } => pipe.zrem(key, member).ignore(),
            };
        }

        let mut conn = self.conn.clone();
        tokio::time::timeout(self.timeout, pipe.query_async::<()>(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Redis MULTI exceeded {:?}", self.timeout)))?
            .map_err(|e| Error::StateStore(format!("Redis MULTI failed: {e}")))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::keys;

    async fn connect() -> RedisStateStore {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            ..RedisConfig::default()
        };
        RedisStateStore::connect(&config).await.unwrap()
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(10)), 10_000);
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_counter_starts_from_initial() {
        let store = connect().await;
        let key = format!("test:{}:{}", keys::SSRC_COUNTER, nanoid::nanoid!(8));

        assert_eq!(store.incr_from(&key, keys::SSRC_INITIAL).await.unwrap(), 10000);
        assert_eq!(store.incr_from(&key, keys::SSRC_INITIAL).await.unwrap(), 10001);
        store.del(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_lock_primitives() {
        let store = connect().await;
        let key = format!("test:lock:{}", nanoid::nanoid!(8));

        assert!(store.set_nx_with_ttl(&key, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx_with_ttl(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert!(!store.compare_and_delete(&key, "b").await.unwrap());
        assert!(store.compare_and_delete(&key, "a").await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_atomic_batch_and_sorted_sets() {
        let store = connect().await;
        let suffix = nanoid::nanoid!(8);
        let set_key = format!("test:set:{suffix}");
        let zset_key = format!("test:zset:{suffix}");

        let mut batch = WriteBatch::new();
        batch
            .sadd(&set_key, "relay-root-1")
            .zadd(&zset_key, "inj-1", 2.0)
            .zadd(&zset_key, "inj-2", 1.0);
        store.apply(batch).await.unwrap();

        assert!(store.sismember(&set_key, "relay-root-1").await.unwrap());
        assert_eq!(
            store.zrange_with_scores(&zset_key).await.unwrap(),
            vec![("inj-2".to_string(), 1.0), ("inj-1".to_string(), 2.0)]
        );
        assert_eq!(store.zincr_by(&zset_key, "inj-2", 5.0).await.unwrap(), 6.0);
        assert_eq!(store.zrange_by_score(&zset_key, 3.0).await.unwrap(), vec!["inj-1"]);

        store.del(&set_key).await.unwrap();
        store.del(&zset_key).await.unwrap();
    }
}

//! Shared state store
//!
//! `StateStore` is the port over a Redis-like key-value store with hashes,
//! sets, sorted sets, counters and pub/sub. It only exposes primitives; the
//! key layout lives in [`keys`] and the typed operations in [`MeshState`].

pub mod keys;
pub mod lock;
pub mod memory;
pub mod mesh;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;

pub use self::lock::{LockGuard, ScalingLock};
pub use self::memory::MemoryStateStore;
pub use self::mesh::MeshState;
pub use self::redis_store::RedisStateStore;

/// A single write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, fields: Vec<(String, String)> },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
}

/// Writes applied all-or-nothing (MULTI/EXEC on Redis)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Del { key: key.into() });
        self
    }

    pub fn hset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(WriteOp::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(WriteOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Key-value store port
///
/// Every method is a single round trip. Single-key operations are atomic;
/// multi-key atomicity is only available through [`StateStore::apply`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// SET NX with expiry. Returns `true` when the key was written.
    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditional SET with expiry
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete `key` only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Returns `true` if the key existed
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Empty map when the hash does not exist
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Returns `true` if the member was newly added
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns `true` if the member was present
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn scard(&self, key: &str) -> Result<usize>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Returns the new score
    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Every member with its score, ascending by score
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Members with score in `(-inf, max]`, ascending
    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>>;

    /// Initialise the counter to `initial` if absent, then increment it
    async fn incr_from(&self, key: &str, initial: i64) -> Result<i64>;

    /// Returns the number of subscribers that received the message
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Apply every write in the batch atomically
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch_builder() {
        let mut batch = WriteBatch::new();
        batch
            .set("topo:parent:relay-root-1", "injection-1")
            .sadd("topo:children:injection-1", "relay-root-1")
            .zadd("pool:relay:load", "relay-root-1", 0.0);

        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        assert_eq!(
            batch.ops()[1],
            WriteOp::SAdd {
                key: "topo:children:injection-1".to_string(),
                member: "relay-root-1".to_string(),
            }
        );
    }
}

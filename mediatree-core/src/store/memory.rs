//! In-memory state store
//!
//! Single-process stand-in for Redis used by tests and local runs. It keeps
//! the same key namespace semantics (one value type per key), honours TTLs on
//! string keys and records every publish so callers can assert on events.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{StateStore, WriteBatch, WriteOp};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    published: Vec<(String, String)>,
    unavailable: bool,
    failing_channels: HashSet<String>,
}

impl Inner {
    fn check(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::StateStore("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let had_string = self.live_string(key).is_some();
        self.strings.remove(key);
        let had_hash = self.hashes.remove(key).is_some();
        let had_set = self.sets.remove(key).is_some();
        let had_zset = self.zsets.remove(key).is_some();
        had_string || had_hash || had_set || had_zset
    }

    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)]) {
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
    }

    fn sorted_zset(&self, key: &str) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

/// In-memory [`StateStore`]
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(channel, payload)` published so far, oldest first
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().published.clone()
    }

    /// Payloads published on one channel, oldest first
    #[must_use]
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        self.inner.lock().published.clear();
    }

    /// Make every subsequent call fail with a store error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Make publishes on `channel` fail
    pub fn fail_publish_on(&self, channel: &str) {
        self.inner.lock().failing_channels.insert(channel.to_string());
    }

    /// All live keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let strings: Vec<String> = inner.strings.keys().cloned().collect();
        let mut keys: BTreeSet<String> = strings
            .into_iter()
            .filter(|k| inner.live_string(k).is_some())
            .collect();
        keys.extend(inner.hashes.keys().cloned());
        keys.extend(inner.sets.keys().cloned());
        keys.extend(inner.zsets.keys().cloned());
        keys.into_iter().collect()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn ping(&self) -> Result<()> {
        self.inner.lock().check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner.live_string(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        if inner.live_string(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.strings.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        if inner.live_string(key).is_some_and(|v| v == expected) {
            inner.strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner.remove_key(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner.live_string(key).is_some()
            || inner.hashes.contains_key(key)
            || inner.sets.contains_key(key)
            || inner.zsets.contains_key(key))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.hset(key, fields);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner.sadd(key, member))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner.srem(key, member))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner.sets.get(key).map_or(0, BTreeSet::len))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.zadd(key, member, score);
        Ok(())
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let score = inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner.zrem(key, member))
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner.sorted_zset(key))
    }

    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .sorted_zset(key)
            .into_iter()
            .filter(|(_, score)| *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn incr_from(&self, key: &str, initial: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let current = match inner.live_string(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| Error::StateStore(format!("{key} is not an integer")))?,
            None => initial,
        };
        let next = current + 1;
        inner.strings.insert(key.to_string(), (next.to_string(), None));
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check()?;
        if inner.failing_channels.contains(channel) {
            return Err(Error::StateStore(format!("publish on {channel} failed")));
        }
        inner
            .published
            .push((channel.to_string(), payload.to_string()));
        Ok(1)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        for op in batch.ops() {
            match op {
                WriteOp::Set { key, value } => {
                    inner.strings.insert(key.clone(), (value.clone(), None));
                }
                WriteOp::Del { key } => {
                    inner.remove_key(key);
                }
                WriteOp::HSet { key, fields } => inner.hset(key, fields),
                WriteOp::SAdd { key, member } => {
                    inner.sadd(key, member);
                }
                WriteOp::SRem { key, member } => {
                    inner.srem(key, member);
                }
                WriteOp::ZAdd { key, member, score } => inner.zadd(key, member, *score),
                WriteOp::ZRem { key, member } => {
                    inner.zrem(key, member);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStateStore::new();
        assert!(store
            .set_nx_with_ttl("lock:scaling:injection", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_nx_with_ttl("lock:scaling:injection", "b", Duration::from_secs(10))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(!store.exists("lock:scaling:injection").await.unwrap());
        assert!(store
            .set_nx_with_ttl("lock:scaling:injection", "b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStateStore::new();
        store
            .set_with_ttl("lock", "owner", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!store.compare_and_delete("lock", "intruder").await.unwrap());
        assert!(store.compare_and_delete("lock", "owner").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_initialisation() {
        let store = MemoryStateStore::new();
        assert_eq!(store.incr_from("ssrc_counter", 9999).await.unwrap(), 10000);
        assert_eq!(store.incr_from("ssrc_counter", 9999).await.unwrap(), 10001);
        assert_eq!(store.incr_from("room_counter", 999).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_empty_sets_disappear() {
        let store = MemoryStateStore::new();
        store.sadd("routes:s:r", "eg-1").await.unwrap();
        assert!(store.exists("routes:s:r").await.unwrap());
        assert!(store.srem("routes:s:r", "eg-1").await.unwrap());
        assert!(!store.exists("routes:s:r").await.unwrap());
        assert_eq!(store.scard("routes:s:r").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering() {
        let store = MemoryStateStore::new();
        store.zadd("pool:egress:load", "eg-2", 1.0).await.unwrap();
        store.zadd("pool:egress:load", "eg-1", 1.0).await.unwrap();
        store.zadd("pool:egress:load", "eg-3", 0.0).await.unwrap();
        assert_eq!(
            store.zincr_by("pool:egress:load", "eg-3", 2.0).await.unwrap(),
            2.0
        );

        let entries = store.zrange_with_scores("pool:egress:load").await.unwrap();
        let members: Vec<&str> = entries.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["eg-1", "eg-2", "eg-3"]);
        assert_eq!(
            store.zrange_by_score("pool:egress:load", 1.0).await.unwrap(),
            vec!["eg-1", "eg-2"]
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStateStore::new();
        store.fail_publish_on("sessions:eg-1");
        assert!(store.publish("sessions:eg-1", "{}").await.is_err());
        assert_eq!(store.publish("sessions:eg-2", "{}").await.unwrap(), 1);
        assert_eq!(store.published_on("sessions:eg-2"), vec!["{}"]);

        store.set_unavailable(true);
        assert!(matches!(
            store.get("anything").await,
            Err(Error::StateStore(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_applies_all_ops() {
        let store = MemoryStateStore::new();
        let mut batch = WriteBatch::new();
        batch
            .hset(
                "session:sess-A",
                vec![("roomId".to_string(), "1000".to_string())],
            )
            .sadd("sessions:all", "sess-A")
            .set("path:sess-A:eg-1", "inj-1,relay-root-1,eg-1");
        store.apply(batch).await.unwrap();

        assert_eq!(
            store.keys(),
            vec!["path:sess-A:eg-1", "session:sess-A", "sessions:all"]
        );
    }
}

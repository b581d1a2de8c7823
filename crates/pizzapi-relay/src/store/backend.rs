//! Key/value backends for the shared relay state.
//!
//! [`RedisBackend`] is the production backend shared across relay nodes.
//! [`MemoryBackend`] serves single-node deployments (`PIZZAPI_REDIS_URL`
//! unset or `off`) and tests; its pub/sub is a process-local broadcast.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// Storage operations the relay state rides on. Mirrors the Redis data
/// types actually used: hashes, sets, counters, strings and capped lists,
/// plus pub/sub for the cross-node bus.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Write hash fields and (re)set the key TTL.
    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()>;

    /// Update fields of an existing hash, refreshing its TTL. No-op
    /// returning false when the key is absent.
    async fn hash_update(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<bool>;

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Pipelined multi-get; one round-trip for any number of keys.
    async fn hash_get_many(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<Option<HashMap<String, String>>>>;

    /// Delete any number of keys with a single variadic command.
    async fn delete(&self, keys: Vec<String>) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically increment a counter, refreshing its TTL.
    async fn counter_incr(&self, key: &str, ttl: Duration) -> Result<u64>;

    async fn counter_get(&self, key: &str) -> Result<u64>;

    /// Set a string only if absent. Returns whether the write happened.
    async fn string_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read and delete a string in one step.
    async fn string_take(&self, key: &str) -> Result<Option<String>>;

    /// Append to a list, trim it to the newest `cap` entries and refresh
    /// the TTL — one transactional batch.
    async fn list_append_capped(
        &self,
        key: &str,
        entry: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<()>;

    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. Messages arrive on the returned receiver
    /// until the backing connection drops.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

// ============================================================================
// Redis
// ============================================================================

pub struct RedisBackend {
    conn: ConnectionManager,
    client: redis::Client,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parsing redis URL")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("connecting to redis")?;
        Ok(Self { conn, client })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()> {
        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in &fields {
            hset.arg(field).arg(value);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.add_command(hset).ignore();
        pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms(ttl)).ignore();
        pipe.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn hash_update(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.hash_set(key, fields, ttl).await?;
        Ok(true)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hash_get_many(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<Option<HashMap<String, String>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut self.conn()).await?;
        Ok(maps
            .into_iter()
            .map(|map| if map.is_empty() { None } else { Some(map) })
            .collect())
    }

    async fn delete(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        redis::cmd("DEL")
            .arg(&keys)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let n: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(n != 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms(ttl))
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SADD").arg(key).arg(member).ignore();
        pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms(ttl)).ignore();
        pipe.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn counter_incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(key);
        pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms(ttl)).ignore();
        let (value,): (u64,) = pipe.query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn counter_get(&self, key: &str) -> Result<u64> {
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn string_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn string_take(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn list_append_capped(
        &self,
        key: &str,
        entry: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("RPUSH").arg(key).arg(entry).ignore();
        pipe.cmd("LTRIM")
            .arg(key)
            .arg(-(cap as i64))
            .arg(-1)
            .ignore();
        pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms(ttl)).ignore();
        pipe.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.conn())
            .await?;
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context("opening pubsub connection")?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("subscribing to {channel}"))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone)]
enum Stored {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Str(String),
    Counter(u64),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > Instant::now())
    }
}

/// Process-local backend with the same semantics as [`RedisBackend`],
/// including lazy TTL eviction and a broadcast-based pub/sub.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Entry>) -> T,
    ) -> T {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        match data.get_mut(key) {
            Some(entry) if entry.live() => f(Some(entry)),
            Some(_) => {
                data.remove(key);
                f(None)
            }
            None => f(None),
        }
    }

    fn insert(&self, key: &str, value: Stored, ttl: Duration) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()> {
        let updated = self.with_entry(key, |entry| {
            if let Some(Entry { value: Stored::Hash(map), expires_at }) = entry {
                map.extend(fields.clone());
                *expires_at = Some(Instant::now() + ttl);
                true
            } else {
                false
            }
        });
        if !updated {
            self.insert(key, Stored::Hash(fields.into_iter().collect()), ttl);
        }
        Ok(())
    }

    async fn hash_update(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.hash_set(key, fields, ttl).await?;
        Ok(true)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(self.with_entry(key, |entry| match entry {
            Some(Entry { value: Stored::Hash(map), .. }) => Some(map.clone()),
            _ => None,
        }))
    }

    async fn hash_get_many(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<Option<HashMap<String, String>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.hash_get_all(&key).await?);
        }
        Ok(out)
    }

    async fn delete(&self, keys: Vec<String>) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            data.remove(&key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.with_entry(key, |entry| entry.is_some()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_entry(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let updated = self.with_entry(key, |entry| {
            if let Some(Entry { value: Stored::Set(set), expires_at }) = entry {
                set.insert(member.to_string());
                *expires_at = Some(Instant::now() + ttl);
                true
            } else {
                false
            }
        });
        if !updated {
            self.insert(
                key,
                Stored::Set(HashSet::from([member.to_string()])),
                ttl,
            );
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        self.with_entry(key, |entry| {
            if let Some(Entry { value: Stored::Set(set), .. }) = entry {
                set.remove(member);
            }
        });
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.with_entry(key, |entry| match entry {
            Some(Entry { value: Stored::Set(set), .. }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }))
    }

    async fn counter_incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let next = self.with_entry(key, |entry| {
            if let Some(Entry { value: Stored::Counter(n), expires_at }) = entry {
                *n += 1;
                *expires_at = Some(Instant::now() + ttl);
                Some(*n)
            } else {
                None
            }
        });
        match next {
            Some(n) => Ok(n),
            None => {
                self.insert(key, Stored::Counter(1), ttl);
                Ok(1)
            }
        }
    }

    async fn counter_get(&self, key: &str) -> Result<u64> {
        Ok(self.with_entry(key, |entry| match entry {
            Some(Entry { value: Stored::Counter(n), .. }) => *n,
            _ => 0,
        }))
    }

    async fn string_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.insert(key, Stored::Str(value.to_string()), ttl);
        Ok(true)
    }

    async fn string_take(&self, key: &str) -> Result<Option<String>> {
        let value = self.with_entry(key, |entry| match entry {
            Some(Entry { value: Stored::Str(s), .. }) => Some(s.clone()),
            _ => None,
        });
        if value.is_some() {
            self.delete(vec![key.to_string()]).await?;
        }
        Ok(value)
    }

    async fn list_append_capped(
        &self,
        key: &str,
        entry: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<()> {
        let appended = self.with_entry(key, |existing| {
            if let Some(Entry { value: Stored::List(list), expires_at }) = existing {
                list.push(entry.to_string());
                if list.len() > cap {
                    let excess = list.len() - cap;
                    list.drain(..excess);
                }
                *expires_at = Some(Instant::now() + ttl);
                true
            } else {
                false
            }
        });
        if !appended {
            self.insert(key, Stored::List(vec![entry.to_string()]), ttl);
        }
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.with_entry(key, |entry| match entry {
            Some(Entry { value: Stored::List(list), .. }) => list.clone(),
            _ => Vec::new(),
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut source = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::from_secs(60)
    }

    #[tokio::test]
    async fn hash_update_is_noop_when_absent() {
        let backend = MemoryBackend::new();
        let updated = backend
            .hash_update("missing", vec![("a".into(), "1".into())], ttl())
            .await
            .unwrap();
        assert!(!updated);
        assert!(backend.hash_get_all("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hash_set_merges_fields() {
        let backend = MemoryBackend::new();
        backend
            .hash_set("h", vec![("a".into(), "1".into()), ("b".into(), "2".into())], ttl())
            .await
            .unwrap();
        backend
            .hash_set("h", vec![("b".into(), "3".into())], ttl())
            .await
            .unwrap();

        let map = backend.hash_get_all("h").await.unwrap().unwrap();
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "3");
    }

    #[tokio::test]
    async fn set_nx_only_writes_once() {
        let backend = MemoryBackend::new();
        assert!(backend.string_set_nx("k", "first", ttl()).await.unwrap());
        assert!(!backend.string_set_nx("k", "second", ttl()).await.unwrap());
        assert_eq!(
            backend.string_take("k").await.unwrap().as_deref(),
            Some("first")
        );
        assert!(backend.string_take("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capped_list_keeps_newest() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend
                .list_append_capped("l", &i.to_string(), 3, ttl())
                .await
                .unwrap();
        }
        assert_eq!(backend.list_range("l").await.unwrap(), vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn counter_is_monotonic() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.counter_incr("c", ttl()).await.unwrap(), 1);
        assert_eq!(backend.counter_incr("c", ttl()).await.unwrap(), 2);
        assert_eq!(backend.counter_get("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let backend = MemoryBackend::new();
        backend
            .hash_set("h", vec![("a".into(), "1".into())], Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.hash_get_all("h").await.unwrap().is_none());
        assert!(!backend.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn pubsub_round_trip() {
        let backend = MemoryBackend::new();
        let mut rx = backend.subscribe("bus").await.unwrap();
        backend.publish("bus", "hello").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(msg.as_deref(), Some("hello"));
    }
}

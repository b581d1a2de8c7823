//! Bounded per-session event cache.
//!
//! Keeps the newest N producer events per session so late-joining viewers
//! can be handed a snapshot after the producer is gone. Ephemeral sessions
//! get the short ephemeral TTL; persistent sessions keep events for the
//! configured event TTL.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::store::{Keys, KvBackend};
use crate::util::now_ms;

/// One cached entry: the event plus its arrival timestamp (unix ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEvent {
    pub ts: i64,
    pub event: Value,
}

#[derive(Clone)]
pub struct EventCache {
    backend: Arc<dyn KvBackend>,
    keys: Keys,
    buffer_size: usize,
    event_ttl: Duration,
    ephemeral_ttl: Duration,
    warned: Arc<AtomicBool>,
}

impl EventCache {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        keys: Keys,
        buffer_size: usize,
        event_ttl: Duration,
        ephemeral_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            keys,
            buffer_size,
            event_ttl,
            ephemeral_ttl,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn note_error(&self, op: &str, err: &anyhow::Error) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("event cache unavailable ({op}): {err:#}; replay disabled");
        } else {
            debug!("event cache error ({op}): {err:#}");
        }
    }

    /// Append an event, trim to the buffer size and reset the TTL — one
    /// transactional batch on the backend.
    pub async fn append(&self, session_id: &str, event: &Value, is_ephemeral: bool) {
        let entry = CachedEvent {
            ts: now_ms(),
            event: event.clone(),
        };
        let Ok(serialized) = serde_json::to_string(&entry) else {
            return;
        };
        let ttl = if is_ephemeral {
            self.ephemeral_ttl
        } else {
            self.event_ttl
        };
        if let Err(err) = self
            .backend
            .list_append_capped(
                &self.keys.events(session_id),
                &serialized,
                self.buffer_size,
                ttl,
            )
            .await
        {
            self.note_error("append", &err);
        }
    }

    /// Cached events, oldest first.
    pub async fn get_all(&self, session_id: &str) -> Vec<CachedEvent> {
        match self.backend.list_range(&self.keys.events(session_id)).await {
            Ok(entries) => entries
                .iter()
                .filter_map(|entry| serde_json::from_str(entry).ok())
                .collect(),
            Err(err) => {
                self.note_error("get_all", &err);
                Vec::new()
            }
        }
    }

    pub async fn delete(&self, session_id: &str) {
        self.delete_batch(&[session_id.to_string()]).await;
    }

    /// Drop the caches for any number of sessions with a single variadic
    /// delete.
    pub async fn delete_batch(&self, session_ids: &[String]) {
        if session_ids.is_empty() {
            return;
        }
        let keys = session_ids.iter().map(|id| self.keys.events(id)).collect();
        if let Err(err) = self.backend.delete(keys).await {
            self.note_error("delete_batch", &err);
        }
    }

    /// Walk the cache newest-to-oldest and return the first event that fully
    /// describes session state.
    pub fn find_latest_snapshot(events: &[CachedEvent]) -> Option<&Value> {
        events
            .iter()
            .rev()
            .map(|entry| &entry.event)
            .find(|event| is_snapshot_event(event))
    }
}

/// Whether an event payload can stand in for the whole session state: an
/// `agent_end` carrying the message list, or a `session_active` carrying a
/// state object.
pub fn is_snapshot_event(event: &Value) -> bool {
    match event.get("type").and_then(Value::as_str) {
        Some("agent_end") => event.get("messages").is_some_and(Value::is_array),
        Some("session_active") => event.get("state").is_some_and(|state| !state.is_null()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn cache_with(backend: Arc<dyn KvBackend>) -> EventCache {
        EventCache::new(
            backend,
            Keys::new(None),
            5,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let cache = cache_with(Arc::new(MemoryBackend::new()));
        for i in 0..3 {
            cache
                .append("s-1", &json!({"type": "text", "delta": i}), true)
                .await;
        }
        let events = cache.get_all("s-1").await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event["delta"], 0);
        assert_eq!(events[2].event["delta"], 2);
    }

    #[tokio::test]
    async fn buffer_is_capped_to_newest() {
        let cache = cache_with(Arc::new(MemoryBackend::new()));
        for i in 0..8 {
            cache.append("s-1", &json!({"n": i}), true).await;
        }
        let events = cache.get_all("s-1").await;
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].event["n"], 3);
        assert_eq!(events[4].event["n"], 7);
    }

    #[test]
    fn snapshot_detection() {
        assert!(is_snapshot_event(&json!({"type": "agent_end", "messages": []})));
        assert!(is_snapshot_event(
            &json!({"type": "session_active", "state": {"x": 1}})
        ));
        assert!(!is_snapshot_event(&json!({"type": "agent_end"})));
        assert!(!is_snapshot_event(
            &json!({"type": "agent_end", "messages": "nope"})
        ));
        assert!(!is_snapshot_event(
            &json!({"type": "session_active", "state": null})
        ));
        assert!(!is_snapshot_event(&json!({"type": "text", "delta": "hi"})));
    }

    #[test]
    fn latest_snapshot_wins() {
        let events = vec![
            CachedEvent { ts: 1, event: json!({"type": "agent_end", "messages": ["old"]}) },
            CachedEvent { ts: 2, event: json!({"type": "text", "delta": "x"}) },
            CachedEvent { ts: 3, event: json!({"type": "session_active", "state": {"v": 2}}) },
            CachedEvent { ts: 4, event: json!({"type": "text", "delta": "y"}) },
        ];
        let snapshot = EventCache::find_latest_snapshot(&events).unwrap();
        assert_eq!(snapshot["type"], "session_active");
        assert_eq!(snapshot["state"]["v"], 2);
    }

    /// Backend wrapper counting `delete` invocations.
    struct CountingBackend {
        inner: MemoryBackend,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl KvBackend for CountingBackend {
        async fn hash_set(&self, k: &str, f: Vec<(String, String)>, t: Duration) -> Result<()> {
            self.inner.hash_set(k, f, t).await
        }
        async fn hash_update(
            &self,
            k: &str,
            f: Vec<(String, String)>,
            t: Duration,
        ) -> Result<bool> {
            self.inner.hash_update(k, f, t).await
        }
        async fn hash_get_all(&self, k: &str) -> Result<Option<HashMap<String, String>>> {
            self.inner.hash_get_all(k).await
        }
        async fn hash_get_many(
            &self,
            k: Vec<String>,
        ) -> Result<Vec<Option<HashMap<String, String>>>> {
            self.inner.hash_get_many(k).await
        }
        async fn delete(&self, keys: Vec<String>) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(keys).await
        }
        async fn exists(&self, k: &str) -> Result<bool> {
            self.inner.exists(k).await
        }
        async fn expire(&self, k: &str, t: Duration) -> Result<()> {
            self.inner.expire(k, t).await
        }
        async fn set_add(&self, k: &str, m: &str, t: Duration) -> Result<()> {
            self.inner.set_add(k, m, t).await
        }
        async fn set_remove(&self, k: &str, m: &str) -> Result<()> {
            self.inner.set_remove(k, m).await
        }
        async fn set_members(&self, k: &str) -> Result<Vec<String>> {
            self.inner.set_members(k).await
        }
        async fn counter_incr(&self, k: &str, t: Duration) -> Result<u64> {
            self.inner.counter_incr(k, t).await
        }
        async fn counter_get(&self, k: &str) -> Result<u64> {
            self.inner.counter_get(k).await
        }
        async fn string_set_nx(&self, k: &str, v: &str, t: Duration) -> Result<bool> {
            self.inner.string_set_nx(k, v, t).await
        }
        async fn string_take(&self, k: &str) -> Result<Option<String>> {
            self.inner.string_take(k).await
        }
        async fn list_append_capped(
            &self,
            k: &str,
            e: &str,
            c: usize,
            t: Duration,
        ) -> Result<()> {
            self.inner.list_append_capped(k, e, c, t).await
        }
        async fn list_range(&self, k: &str) -> Result<Vec<String>> {
            self.inner.list_range(k).await
        }
        async fn publish(&self, c: &str, p: &str) -> Result<()> {
            self.inner.publish(c, p).await
        }
        async fn subscribe(&self, c: &str) -> Result<mpsc::Receiver<String>> {
            self.inner.subscribe(c).await
        }
    }

    #[tokio::test]
    async fn batch_delete_issues_one_backend_command() {
        let backend = Arc::new(CountingBackend {
            inner: MemoryBackend::new(),
            deletes: AtomicUsize::new(0),
        });
        let cache = cache_with(backend.clone());

        for id in ["a", "b", "c"] {
            cache.append(id, &json!({"type": "text"}), true).await;
        }
        cache
            .delete_batch(&["a".into(), "b".into(), "c".into()])
            .await;

        assert_eq!(backend.deletes.load(Ordering::SeqCst), 1);
        assert!(cache.get_all("a").await.is_empty());
        assert!(cache.get_all("b").await.is_empty());
        assert!(cache.get_all("c").await.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_delete_is_free() {
        let backend = Arc::new(CountingBackend {
            inner: MemoryBackend::new(),
            deletes: AtomicUsize::new(0),
        });
        let cache = cache_with(backend.clone());
        cache.delete_batch(&[]).await;
        assert_eq!(backend.deletes.load(Ordering::SeqCst), 0);
    }
}

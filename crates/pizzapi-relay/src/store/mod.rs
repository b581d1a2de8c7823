//! Typed facade over the shared state store (sessions, runners, terminals,
//! seq counters, pending runner links and their secondary indexes).
//!
//! Every mutating operation refreshes the entity's TTL. When the backend is
//! unreachable the store logs one warning and degrades to no-ops so
//! real-time delivery keeps working within the node; sequence numbers fall
//! back to process-local counters to stay monotonic.

mod backend;
mod keys;
mod models;

pub use backend::{KvBackend, MemoryBackend, RedisBackend};
pub use keys::Keys;
pub use models::{RunnerData, SessionData, TerminalData};

use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const RUNNER_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const TERMINAL_TTL: Duration = Duration::from_secs(60 * 60);
const LINK_TTL: Duration = Duration::from_secs(10 * 60);
/// Indexes outlive the entities they track by this much.
const INDEX_SLACK: Duration = Duration::from_secs(5 * 60);

type Fields = Vec<(String, String)>;

#[derive(Clone)]
pub struct RelayStore {
    backend: Arc<dyn KvBackend>,
    keys: Keys,
    warned: Arc<AtomicBool>,
    /// Highest seq handed out per session, kept as a floor so the counter
    /// stays monotonic if the backend drops out mid-session.
    seq_floor: Arc<DashMap<String, u64>>,
}

impl RelayStore {
    pub fn new(backend: Arc<dyn KvBackend>, org_prefix: Option<&str>) -> Self {
        Self {
            backend,
            keys: Keys::new(org_prefix),
            warned: Arc::new(AtomicBool::new(false)),
            seq_floor: Arc::new(DashMap::new()),
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }

    fn note_error(&self, op: &str, err: &anyhow::Error) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("state store unavailable ({op}): {err:#}; continuing degraded");
        } else {
            debug!("state store error ({op}): {err:#}");
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub async fn create_session(&self, session: &SessionData) {
        let key = self.keys.session(&session.session_id);
        let result = async {
            self.backend
                .hash_set(&key, session.to_fields(), SESSION_TTL)
                .await?;
            self.backend
                .set_add(
                    &self.keys.all_sessions(),
                    &session.session_id,
                    SESSION_TTL + INDEX_SLACK,
                )
                .await?;
            self.backend
                .set_add(
                    &self.keys.user_sessions(&session.user_id),
                    &session.session_id,
                    SESSION_TTL + INDEX_SLACK,
                )
                .await
        }
        .await;
        if let Err(err) = result {
            self.note_error("create_session", &err);
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionData> {
        match self.backend.hash_get_all(&self.keys.session(session_id)).await {
            Ok(map) => map.as_ref().and_then(SessionData::from_fields),
            Err(err) => {
                self.note_error("get_session", &err);
                None
            }
        }
    }

    /// Update individual session fields, refreshing the TTL. No-op when the
    /// session is gone.
    pub async fn update_session(&self, session_id: &str, fields: Fields) -> bool {
        match self
            .backend
            .hash_update(&self.keys.session(session_id), fields, SESSION_TTL)
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                self.note_error("update_session", &err);
                false
            }
        }
    }

    pub async fn set_session_active(
        &self,
        session_id: &str,
        is_active: bool,
        expires_at: Option<i64>,
    ) -> bool {
        let active_flag = if is_active { "1" } else { "0" };
        let mut fields: Fields = vec![("isActive".into(), active_flag.into())];
        if let Some(at) = expires_at {
            fields.push(("expiresAt".into(), at.to_string()));
        }
        self.update_session(session_id, fields).await
    }

    pub async fn record_heartbeat(&self, session_id: &str, at: i64, payload: &Value) -> bool {
        self.update_session(
            session_id,
            vec![
                ("lastHeartbeatAt".into(), at.to_string()),
                ("lastHeartbeat".into(), payload.to_string()),
            ],
        )
        .await
    }

    pub async fn record_state(&self, session_id: &str, state: &Value) -> bool {
        self.update_session(session_id, vec![("lastState".into(), state.to_string())])
            .await
    }

    pub async fn bind_runner(
        &self,
        session_id: &str,
        runner_id: &str,
        runner_name: Option<&str>,
    ) -> bool {
        let mut fields: Fields = vec![("runnerId".into(), runner_id.to_string())];
        if let Some(name) = runner_name {
            fields.push(("runnerName".into(), name.to_string()));
        }
        self.update_session(session_id, fields).await
    }

    /// Push an ephemeral session's expiry forward. Non-ephemeral sessions
    /// only get their TTL refreshed.
    pub async fn touch_session(&self, session: &SessionData, expires_at: i64) {
        if session.is_ephemeral {
            self.update_session(
                &session.session_id,
                vec![("expiresAt".into(), expires_at.to_string())],
            )
            .await;
        } else {
            self.refresh_session_ttl(&session.session_id).await;
        }
    }

    pub async fn refresh_session_ttl(&self, session_id: &str) {
        let result = async {
            self.backend
                .expire(&self.keys.session(session_id), SESSION_TTL)
                .await?;
            self.backend
                .expire(&self.keys.seq(session_id), SESSION_TTL)
                .await
        }
        .await;
        if let Err(err) = result {
            self.note_error("refresh_session_ttl", &err);
        }
    }

    pub async fn delete_session(&self, session_id: &str, user_id: &str) {
        let result = async {
            self.backend
                .delete(vec![
                    self.keys.session(session_id),
                    self.keys.seq(session_id),
                    self.keys.runner_link(session_id),
                ])
                .await?;
            self.backend
                .set_remove(&self.keys.all_sessions(), session_id)
                .await?;
            self.backend
                .set_remove(&self.keys.user_sessions(user_id), session_id)
                .await
        }
        .await;
        self.seq_floor.remove(session_id);
        if let Err(err) = result {
            self.note_error("delete_session", &err);
        }
    }

    pub async fn all_sessions(&self) -> Vec<SessionData> {
        self.sessions_in_index(&self.keys.all_sessions()).await
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<SessionData> {
        self.sessions_in_index(&self.keys.user_sessions(user_id))
            .await
    }

    async fn sessions_in_index(&self, index_key: &str) -> Vec<SessionData> {
        let result = async {
            let ids = self.backend.set_members(index_key).await?;
            let keys = ids.iter().map(|id| self.keys.session(id)).collect();
            self.backend.hash_get_many(keys).await
        }
        .await;
        match result {
            Ok(maps) => maps
                .iter()
                .flatten()
                .filter_map(SessionData::from_fields)
                .collect(),
            Err(err) => {
                self.note_error("sessions_in_index", &err);
                Vec::new()
            }
        }
    }

    /// Assign the next event seq for a session. Strictly monotonic even
    /// across a backend outage.
    pub async fn increment_seq(&self, session_id: &str) -> u64 {
        match self
            .backend
            .counter_incr(&self.keys.seq(session_id), SESSION_TTL)
            .await
        {
            Ok(seq) => {
                let mut floor = self.seq_floor.entry(session_id.to_string()).or_insert(0);
                if seq > *floor {
                    *floor = seq;
                    seq
                } else {
                    // Backend counter went backwards (flush/restart); keep
                    // handing out locally monotonic values.
                    *floor += 1;
                    *floor
                }
            }
            Err(err) => {
                self.note_error("increment_seq", &err);
                let mut floor = self.seq_floor.entry(session_id.to_string()).or_insert(0);
                *floor += 1;
                *floor
            }
        }
    }

    pub async fn last_seq(&self, session_id: &str) -> u64 {
        match self.backend.counter_get(&self.keys.seq(session_id)).await {
            Ok(seq) => seq.max(
                self.seq_floor
                    .get(session_id)
                    .map(|floor| *floor)
                    .unwrap_or(0),
            ),
            Err(err) => {
                self.note_error("last_seq", &err);
                self.seq_floor
                    .get(session_id)
                    .map(|floor| *floor)
                    .unwrap_or(0)
            }
        }
    }

    // ========================================================================
    // Pending runner links
    // ========================================================================

    /// Record which runner was asked to spawn a session, before the runner
    /// confirmed. First writer wins.
    pub async fn set_pending_link(&self, session_id: &str, runner_id: &str) -> bool {
        match self
            .backend
            .string_set_nx(&self.keys.runner_link(session_id), runner_id, LINK_TTL)
            .await
        {
            Ok(written) => written,
            Err(err) => {
                self.note_error("set_pending_link", &err);
                false
            }
        }
    }

    /// Consume the pending link for a session, if any.
    pub async fn take_pending_link(&self, session_id: &str) -> Option<String> {
        match self
            .backend
            .string_take(&self.keys.runner_link(session_id))
            .await
        {
            Ok(runner_id) => runner_id,
            Err(err) => {
                self.note_error("take_pending_link", &err);
                None
            }
        }
    }

    // ========================================================================
    // Expiry / index hygiene
    // ========================================================================

    /// Ids of ephemeral sessions whose `expiresAt` has passed. Activity
    /// pushes `expiresAt` forward, so a live session never shows up here.
    pub async fn scan_expired_sessions(&self, now_ms: i64) -> Vec<SessionData> {
        self.all_sessions()
            .await
            .into_iter()
            .filter(|session| {
                session.is_ephemeral
                    && session.expires_at.is_some_and(|at| at <= now_ms)
            })
            .collect()
    }

    /// Drop index members whose entity hash has expired underneath them.
    pub async fn clean_stale_index_entries(&self) {
        self.clean_index(&self.keys.all_sessions(), IndexKind::Session)
            .await;
        self.clean_index(&self.keys.all_runners(), IndexKind::Runner)
            .await;
    }

    async fn clean_index(&self, index_key: &str, kind: IndexKind) {
        let result = async {
            let ids = self.backend.set_members(index_key).await?;
            for id in ids {
                let entity_key = match kind {
                    IndexKind::Session => self.keys.session(&id),
                    IndexKind::Runner => self.keys.runner(&id),
                };
                if !self.backend.exists(&entity_key).await? {
                    debug!("removing stale index member {id} from {index_key}");
                    self.backend.set_remove(index_key, &id).await?;
                }
            }
            anyhow::Ok(())
        }
        .await;
        if let Err(err) = result {
            self.note_error("clean_stale_index_entries", &err);
        }
    }

    // ========================================================================
    // Runners
    // ========================================================================

    pub async fn put_runner(&self, runner: &RunnerData) {
        let result = async {
            self.backend
                .hash_set(
                    &self.keys.runner(&runner.runner_id),
                    runner.to_fields(),
                    RUNNER_TTL,
                )
                .await?;
            self.backend
                .set_add(
                    &self.keys.all_runners(),
                    &runner.runner_id,
                    RUNNER_TTL + INDEX_SLACK,
                )
                .await?;
            self.backend
                .set_add(
                    &self.keys.user_runners(&runner.user_id),
                    &runner.runner_id,
                    RUNNER_TTL + INDEX_SLACK,
                )
                .await
        }
        .await;
        if let Err(err) = result {
            self.note_error("put_runner", &err);
        }
    }

    pub async fn get_runner(&self, runner_id: &str) -> Option<RunnerData> {
        match self.backend.hash_get_all(&self.keys.runner(runner_id)).await {
            Ok(map) => map.as_ref().and_then(RunnerData::from_fields),
            Err(err) => {
                self.note_error("get_runner", &err);
                None
            }
        }
    }

    pub async fn runner_exists(&self, runner_id: &str) -> bool {
        match self.backend.exists(&self.keys.runner(runner_id)).await {
            Ok(exists) => exists,
            Err(err) => {
                self.note_error("runner_exists", &err);
                false
            }
        }
    }

    /// Refresh the runner TTL; called on heartbeat/ping traffic.
    pub async fn touch_runner(&self, runner_id: &str) {
        if let Err(err) = self
            .backend
            .expire(&self.keys.runner(runner_id), RUNNER_TTL)
            .await
        {
            self.note_error("touch_runner", &err);
        }
    }

    pub async fn update_runner(&self, runner_id: &str, fields: Fields) -> bool {
        match self
            .backend
            .hash_update(&self.keys.runner(runner_id), fields, RUNNER_TTL)
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                self.note_error("update_runner", &err);
                false
            }
        }
    }

    pub async fn delete_runner(&self, runner_id: &str, user_id: &str) {
        let result = async {
            self.backend
                .delete(vec![
                    self.keys.runner(runner_id),
                    self.keys.runner_terminals(runner_id),
                ])
                .await?;
            self.backend
                .set_remove(&self.keys.all_runners(), runner_id)
                .await?;
            self.backend
                .set_remove(&self.keys.user_runners(user_id), runner_id)
                .await
        }
        .await;
        if let Err(err) = result {
            self.note_error("delete_runner", &err);
        }
    }

    pub async fn runners_for_user(&self, user_id: &str) -> Vec<RunnerData> {
        let result = async {
            let ids = self
                .backend
                .set_members(&self.keys.user_runners(user_id))
                .await?;
            let keys = ids.iter().map(|id| self.keys.runner(id)).collect();
            self.backend.hash_get_many(keys).await
        }
        .await;
        match result {
            Ok(maps) => maps
                .iter()
                .flatten()
                .filter_map(RunnerData::from_fields)
                .collect(),
            Err(err) => {
                self.note_error("runners_for_user", &err);
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Terminals
    // ========================================================================

    pub async fn put_terminal(&self, terminal: &TerminalData) {
        let result = async {
            self.backend
                .hash_set(
                    &self.keys.terminal(&terminal.terminal_id),
                    terminal.to_fields(),
                    TERMINAL_TTL,
                )
                .await?;
            self.backend
                .set_add(
                    &self.keys.runner_terminals(&terminal.runner_id),
                    &terminal.terminal_id,
                    TERMINAL_TTL + INDEX_SLACK,
                )
                .await
        }
        .await;
        if let Err(err) = result {
            self.note_error("put_terminal", &err);
        }
    }

    pub async fn get_terminal(&self, terminal_id: &str) -> Option<TerminalData> {
        match self
            .backend
            .hash_get_all(&self.keys.terminal(terminal_id))
            .await
        {
            Ok(map) => map.as_ref().and_then(TerminalData::from_fields),
            Err(err) => {
                self.note_error("get_terminal", &err);
                None
            }
        }
    }

    pub async fn update_terminal(&self, terminal_id: &str, fields: Fields) -> bool {
        match self
            .backend
            .hash_update(&self.keys.terminal(terminal_id), fields, TERMINAL_TTL)
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                self.note_error("update_terminal", &err);
                false
            }
        }
    }

    pub async fn delete_terminal(&self, terminal_id: &str, runner_id: &str) {
        let result = async {
            self.backend
                .delete(vec![self.keys.terminal(terminal_id)])
                .await?;
            self.backend
                .set_remove(&self.keys.runner_terminals(runner_id), terminal_id)
                .await
        }
        .await;
        if let Err(err) = result {
            self.note_error("delete_terminal", &err);
        }
    }

    pub async fn terminals_for_runner(&self, runner_id: &str) -> Vec<TerminalData> {
        let result = async {
            let ids = self
                .backend
                .set_members(&self.keys.runner_terminals(runner_id))
                .await?;
            let keys = ids.iter().map(|id| self.keys.terminal(id)).collect();
            self.backend.hash_get_many(keys).await
        }
        .await;
        match result {
            Ok(maps) => maps
                .iter()
                .flatten()
                .filter_map(TerminalData::from_fields)
                .collect(),
            Err(err) => {
                self.note_error("terminals_for_runner", &err);
                Vec::new()
            }
        }
    }
}

#[derive(Clone, Copy)]
enum IndexKind {
    Session,
    Runner,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> RelayStore {
        RelayStore::new(Arc::new(MemoryBackend::new()), None)
    }

    fn session(id: &str, user: &str, ephemeral: bool, expires_at: Option<i64>) -> SessionData {
        SessionData {
            session_id: id.into(),
            token: "tok".into(),
            cwd: "/work".into(),
            share_url: String::new(),
            started_at: 0,
            user_id: user.into(),
            user_name: "Ada".into(),
            session_name: None,
            collab_mode: false,
            is_active: true,
            last_heartbeat_at: None,
            last_heartbeat: None,
            last_state: None,
            runner_id: None,
            runner_name: None,
            is_ephemeral: ephemeral,
            expires_at,
        }
    }

    #[tokio::test]
    async fn session_crud_and_indexes() {
        let store = test_store();
        store.create_session(&session("s-1", "u-1", true, None)).await;
        store.create_session(&session("s-2", "u-2", true, None)).await;

        assert!(store.get_session("s-1").await.is_some());
        assert_eq!(store.sessions_for_user("u-1").await.len(), 1);
        assert_eq!(store.all_sessions().await.len(), 2);

        store.delete_session("s-1", "u-1").await;
        assert!(store.get_session("s-1").await.is_none());
        assert!(store.sessions_for_user("u-1").await.is_empty());
        assert_eq!(store.all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn update_session_is_noop_for_missing_session() {
        let store = test_store();
        assert!(
            !store
                .update_session("ghost", vec![("isActive".into(), "0".into())])
                .await
        );
    }

    #[tokio::test]
    async fn heartbeat_and_state_updates_round_trip() {
        let store = test_store();
        store.create_session(&session("s-1", "u-1", true, None)).await;

        assert!(
            store
                .record_heartbeat("s-1", 123, &json!({"type": "heartbeat", "n": 1}))
                .await
        );
        assert!(store.record_state("s-1", &json!({"messages": []})).await);

        let loaded = store.get_session("s-1").await.unwrap();
        assert_eq!(loaded.last_heartbeat_at, Some(123));
        assert_eq!(loaded.last_heartbeat.unwrap()["n"], 1);
        assert!(loaded.last_state.is_some());
    }

    #[tokio::test]
    async fn seq_is_strictly_monotonic() {
        let store = test_store();
        let mut last = 0;
        for _ in 0..100 {
            let seq = store.increment_seq("s-1").await;
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(store.last_seq("s-1").await, last);
        // Independent sessions have independent counters.
        assert_eq!(store.increment_seq("s-2").await, 1);
    }

    #[tokio::test]
    async fn pending_link_first_writer_wins_and_is_consumed_once() {
        let store = test_store();
        assert!(store.set_pending_link("s-1", "r-1").await);
        assert!(!store.set_pending_link("s-1", "r-2").await);

        assert_eq!(store.take_pending_link("s-1").await.as_deref(), Some("r-1"));
        assert!(store.take_pending_link("s-1").await.is_none());
    }

    #[tokio::test]
    async fn scan_expired_skips_live_and_non_ephemeral() {
        let store = test_store();
        store
            .create_session(&session("gone", "u-1", true, Some(1_000)))
            .await;
        store
            .create_session(&session("live", "u-1", true, Some(99_000)))
            .await;
        store
            .create_session(&session("pinned", "u-1", false, Some(1_000)))
            .await;

        let expired = store.scan_expired_sessions(50_000).await;
        let ids: Vec<_> = expired.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["gone"]);
    }

    #[tokio::test]
    async fn stale_index_members_are_cleaned() {
        let store = test_store();
        store.create_session(&session("s-1", "u-1", true, None)).await;
        // Simulate the hash expiring while the index member survives.
        store
            .backend
            .delete(vec![store.keys.session("s-1")])
            .await
            .unwrap();

        assert_eq!(store.all_sessions().await.len(), 0);
        store.clean_stale_index_entries().await;
        let members = store
            .backend
            .set_members(&store.keys.all_sessions())
            .await
            .unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn runner_crud() {
        let store = test_store();
        let runner = RunnerData {
            runner_id: "r-1".into(),
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            name: Some("laptop".into()),
            roots: vec!["/home/ada".into()],
            skills: Vec::new(),
        };
        store.put_runner(&runner).await;
        assert!(store.runner_exists("r-1").await);
        assert_eq!(store.runners_for_user("u-1").await.len(), 1);

        store.delete_runner("r-1", "u-1").await;
        assert!(!store.runner_exists("r-1").await);
        assert!(store.runners_for_user("u-1").await.is_empty());
    }
}

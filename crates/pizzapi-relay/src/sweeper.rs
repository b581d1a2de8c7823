//! Periodic expiry sweep.
//!
//! Each tick prunes expired ephemeral sessions from both stores, drops
//! their event caches in one batched delete, evicts expired attachments,
//! and occasionally scrubs stale index members. A failing tick logs and
//! retries on the next one.

use log::{debug, info, warn};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::util::now_ms;

/// Run the stale-index scrub every this many ticks.
const INDEX_CLEAN_EVERY: u64 = 10;

pub fn spawn(state: AppState, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.settings.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            tick += 1;
            sweep_once(&state).await;

            if tick % INDEX_CLEAN_EVERY == 0 {
                state.store.clean_stale_index_entries().await;
            }
        }
        debug!("sweeper stopped");
    })
}

/// One sweep iteration: the union of store-expired and archive-expired
/// sessions is removed everywhere.
pub async fn sweep_once(state: &AppState) {
    let mut expired: BTreeSet<String> = BTreeSet::new();

    let live_expired = state.store.scan_expired_sessions(now_ms()).await;
    for session in &live_expired {
        expired.insert(session.session_id.clone());
    }

    match state.archive.prune_expired().await {
        Ok(pruned) => expired.extend(pruned),
        Err(err) => warn!("archive prune failed, retrying next tick: {err:#}"),
    }

    if !expired.is_empty() {
        let ids: Vec<String> = expired.iter().cloned().collect();
        // One variadic delete for every cache involved.
        state.events.delete_batch(&ids).await;
        for session in &live_expired {
            state
                .store
                .delete_session(&session.session_id, &session.user_id)
                .await;
        }
        info!("swept {} expired session(s)", expired.len());
    }

    match state.attachments.sweep_expired().await {
        Ok(0) => {}
        Ok(removed) => info!("swept {removed} expired attachment(s)"),
        Err(err) => warn!("attachment sweep failed, retrying next tick: {err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use crate::persist::SessionStartInput;
    use crate::store::SessionData;
    use serde_json::json;
    use std::time::Duration;

    fn expired_session(id: &str) -> SessionData {
        SessionData {
            session_id: id.into(),
            token: "tok".into(),
            cwd: "/work".into(),
            share_url: String::new(),
            started_at: 0,
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            session_name: None,
            collab_mode: false,
            is_active: false,
            last_heartbeat_at: None,
            last_heartbeat: None,
            last_state: None,
            runner_id: None,
            runner_name: None,
            is_ephemeral: true,
            expires_at: Some(1),
        }
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions_everywhere() {
        let state = test_state(Duration::from_millis(1)).await;

        state.store.create_session(&expired_session("gone")).await;
        state
            .events
            .append("gone", &json!({"type": "text"}), true)
            .await;
        state
            .archive
            .record_start(&SessionStartInput {
                session_id: "gone".into(),
                user_id: "u-1".into(),
                user_name: "Ada".into(),
                session_name: None,
                cwd: "/work".into(),
                share_url: String::new(),
                is_ephemeral: true,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        sweep_once(&state).await;

        assert!(state.store.get_session("gone").await.is_none());
        assert!(state.events.get_all("gone").await.is_empty());
        assert!(
            state
                .archive
                .list_for_user("u-1", 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn sweep_spares_live_sessions() {
        let state = test_state(Duration::from_secs(600)).await;

        let mut live = expired_session("live");
        live.expires_at = Some(now_ms() + 60_000);
        state.store.create_session(&live).await;

        sweep_once(&state).await;
        assert!(state.store.get_session("live").await.is_some());
    }
}

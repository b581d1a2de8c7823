//! Relational persistence for sessions.
//!
//! Session metadata and the final snapshot state live in two normalized
//! tables so a session stays viewable after its producer is gone. Ephemeral
//! rows carry an `expires_at` that every touch pushes forward; pruning is a
//! single transaction that never loads ids into memory beyond the pruned
//! set itself.

mod db;

pub use db::Database;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use std::time::Duration;

use crate::util::now_ms;

/// Input recorded when a session first appears.
#[derive(Debug, Clone)]
pub struct SessionStartInput {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub session_name: Option<String>,
    pub cwd: String,
    pub share_url: String,
    pub is_ephemeral: bool,
}

/// A persisted session row.
#[derive(Debug, Clone, FromRow)]
pub struct PersistedSession {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub session_name: Option<String>,
    pub cwd: String,
    pub share_url: String,
    pub is_ephemeral: bool,
    pub started_at: i64,
    pub last_active_at: i64,
    pub ended_at: Option<i64>,
    pub expires_at: Option<i64>,
}

/// Metadata joined with the parsed snapshot state, if any.
#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    pub session: PersistedSession,
    pub state: Option<Value>,
}

#[derive(Debug, Clone, FromRow)]
struct SnapshotRow {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub session_name: Option<String>,
    pub cwd: String,
    pub share_url: String,
    pub is_ephemeral: bool,
    pub started_at: i64,
    pub last_active_at: i64,
    pub ended_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub state: Option<String>,
}

/// Repository over the session tables.
#[derive(Debug, Clone)]
pub struct SessionArchive {
    pool: SqlitePool,
    ephemeral_ttl: Duration,
}

impl SessionArchive {
    pub fn new(pool: SqlitePool, ephemeral_ttl: Duration) -> Self {
        Self {
            pool,
            ephemeral_ttl,
        }
    }

    fn ephemeral_deadline(&self, now: i64) -> i64 {
        now + self.ephemeral_ttl.as_millis() as i64
    }

    /// Insert a session if absent. Ephemeral sessions get their first
    /// expiry deadline here.
    pub async fn record_start(&self, input: &SessionStartInput) -> Result<()> {
        let now = now_ms();
        let expires_at = input
            .is_ephemeral
            .then(|| self.ephemeral_deadline(now));

        sqlx::query(
            r#"
            INSERT INTO relay_session (
                id, user_id, user_name, session_name, cwd, share_url,
                is_ephemeral, started_at, last_active_at, ended_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&input.session_id)
        .bind(&input.user_id)
        .bind(&input.user_name)
        .bind(&input.session_name)
        .bind(&input.cwd)
        .bind(&input.share_url)
        .bind(input.is_ephemeral)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("recording session start")?;

        Ok(())
    }

    /// Bump `last_active_at`; only ephemeral rows get their expiry pushed.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            UPDATE relay_session
            SET last_active_at = ?,
                expires_at = CASE WHEN is_ephemeral = 1 THEN ? ELSE expires_at END
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(self.ephemeral_deadline(now))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("touching session")?;

        Ok(())
    }

    /// Upsert the snapshot state and touch the metadata row.
    pub async fn record_state(&self, session_id: &str, state: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_session_state (session_id, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (session_id) DO UPDATE
            SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(state.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("recording session state")?;

        self.touch(session_id).await
    }

    /// Mark the session ended; ephemeral rows linger one more idle TTL for
    /// snapshot replay before the sweeper takes them.
    pub async fn record_end(&self, session_id: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            UPDATE relay_session
            SET ended_at = ?,
                last_active_at = ?,
                expires_at = CASE WHEN is_ephemeral = 1 THEN ? ELSE expires_at END
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(self.ephemeral_deadline(now))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("recording session end")?;

        Ok(())
    }

    /// Metadata plus parsed state, excluding expired rows. Malformed stored
    /// state reads as absent.
    pub async fn get_snapshot(&self, session_id: &str) -> Result<Option<PersistedSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT s.id, s.user_id, s.user_name, s.session_name, s.cwd, s.share_url,
                   s.is_ephemeral, s.started_at, s.last_active_at, s.ended_at, s.expires_at,
                   st.state
            FROM relay_session s
            LEFT JOIN relay_session_state st ON st.session_id = s.id
            WHERE s.id = ?
              AND (s.expires_at IS NULL OR s.expires_at > ?)
            "#,
        )
        .bind(session_id)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .context("fetching session snapshot")?;

        Ok(row.map(|row| {
            let state = row
                .state
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok());
            PersistedSnapshot {
                session: PersistedSession {
                    id: row.id,
                    user_id: row.user_id,
                    user_name: row.user_name,
                    session_name: row.session_name,
                    cwd: row.cwd,
                    share_url: row.share_url,
                    is_ephemeral: row.is_ephemeral,
                    started_at: row.started_at,
                    last_active_at: row.last_active_at,
                    ended_at: row.ended_at,
                    expires_at: row.expires_at,
                },
                state,
            }
        }))
    }

    /// A user's sessions, newest activity first, excluding expired rows.
    pub async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<PersistedSession>> {
        let sessions = sqlx::query_as::<_, PersistedSession>(
            r#"
            SELECT id, user_id, user_name, session_name, cwd, share_url,
                   is_ephemeral, started_at, last_active_at, ended_at, expires_at
            FROM relay_session
            WHERE user_id = ?
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY last_active_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(now_ms())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions for user")?;

        Ok(sessions)
    }

    /// Delete expired sessions and their state in one transaction,
    /// returning the pruned ids.
    pub async fn prune_expired(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await.context("starting prune")?;

        sqlx::query(
            r#"
            DELETE FROM relay_session_state
            WHERE session_id IN (
                SELECT id FROM relay_session
                WHERE expires_at IS NOT NULL AND expires_at <= ?
            )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("pruning session state")?;

        let pruned: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM relay_session
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .context("pruning sessions")?;

        tx.commit().await.context("committing prune")?;
        Ok(pruned)
    }

    // ========================================================================
    // Recent folders
    // ========================================================================

    pub async fn record_recent_folder(&self, user_id: &str, path: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recent_folder (user_id, path, last_used_at)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id, path) DO UPDATE SET last_used_at = excluded.last_used_at
            "#,
        )
        .bind(user_id)
        .bind(path)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("recording recent folder")?;

        Ok(())
    }

    pub async fn recent_folders(&self, user_id: &str, limit: i64) -> Result<Vec<String>> {
        let folders: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT path FROM recent_folder
            WHERE user_id = ?
            ORDER BY last_used_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing recent folders")?;

        Ok(folders)
    }
}

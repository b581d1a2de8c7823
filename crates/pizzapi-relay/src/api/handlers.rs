//! REST handlers.

use axum::{
    Json,
    extract::{FromRequestParts, Multipart, Path, Query, Request, State},
    http::{StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::{info, warn};
use nanoid::nanoid;
use pizzapi_protocol::runner::RunnerServerEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::auth::AuthIdentity;
use crate::ns::end_session;
use crate::persist::SessionStartInput;
use crate::store::SessionData;
use crate::util::{deadline_ms, now_ms};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

// ============================================================================
// Auth plumbing
// ============================================================================

/// Cookie-authenticated identity for REST handlers.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthIdentity);

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0.user_id
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthIdentity>()
            .cloned()
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Resolve the session cookie once per request and stash the identity.
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = state.gate.authenticate_viewer(req.headers()).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

// ============================================================================
// Health / caddy
// ============================================================================

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
pub struct CaddyValidateQuery {
    domain: String,
}

/// GET /api/caddy/validate
///
/// On-demand TLS: Caddy asks whether it should mint a certificate for a
/// subdomain. 200 when the first label matches this relay's org slug.
pub async fn caddy_validate(
    State(state): State<AppState>,
    Query(query): Query<CaddyValidateQuery>,
) -> StatusCode {
    let Some(org) = &state.settings.org else {
        return StatusCode::NOT_FOUND;
    };
    let matches = query
        .domain
        .split('.')
        .next()
        .is_some_and(|label| label.eq_ignore_ascii_case(&org.org_slug));
    if matches {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListEntry {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub cwd: String,
    pub share_url: String,
    pub is_active: bool,
    pub is_ephemeral: bool,
    pub started_at: i64,
    pub last_active_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

/// GET /api/sessions
///
/// The persisted listing, overlaid with liveness from the state store.
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<SessionListEntry>>> {
    let persisted = state.archive.list_for_user(user.id(), 100).await?;

    let mut entries = Vec::with_capacity(persisted.len());
    for session in persisted {
        let live = state.store.get_session(&session.id).await;
        entries.push(SessionListEntry {
            session_id: session.id,
            session_name: session.session_name,
            cwd: session.cwd,
            share_url: session.share_url,
            is_active: live.as_ref().is_some_and(|s| s.is_active),
            is_ephemeral: session.is_ephemeral,
            started_at: session.started_at,
            last_active_at: session.last_active_at,
            ended_at: session.ended_at,
        });
    }
    Ok(Json(entries))
}

/// GET /api/sessions/{session_id}/snapshot
pub async fn session_snapshot(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    // Prefer the live store; fall back to the archive.
    if let Some(session) = state.store.get_session(&session_id).await {
        if let Some(last_state) = session.last_state {
            return Ok(Json(json!({
                "sessionId": session_id,
                "isActive": session.is_active,
                "state": last_state,
            })));
        }
    }

    let snapshot = state
        .archive
        .get_snapshot(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    Ok(Json(json!({
        "sessionId": snapshot.session.id,
        "isActive": false,
        "state": snapshot.state,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionRequest {
    pub runner_id: String,
    pub cwd: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Sessions are ephemeral unless the caller opts out.
    #[serde(default)]
    pub ephemeral: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionResponse {
    pub session_id: String,
    pub share_url: String,
}

/// POST /api/sessions/spawn
///
/// Create the session, record the pending runner link, and ask the runner
/// to spawn a worker. The link resolves when the runner's first event for
/// the session arrives.
pub async fn spawn_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<SpawnSessionRequest>,
) -> ApiResult<Json<SpawnSessionResponse>> {
    let runner = state
        .store
        .get_runner(&request.runner_id)
        .await
        .ok_or_else(|| ApiError::not_found("runner not found"))?;
    if runner.user_id != user.id() {
        return Err(ApiError::Unauthorized);
    }
    if !runner.permits_cwd(&request.cwd) {
        return Err(ApiError::forbidden("cwd is outside the runner's roots"));
    }

    let session_id = nanoid!();
    let is_ephemeral = request.ephemeral.unwrap_or(true);
    let session = SessionData {
        share_url: format!("{}/s/{session_id}", state.settings.share_url_base),
        session_id: session_id.clone(),
        token: nanoid!(),
        cwd: request.cwd.clone(),
        started_at: now_ms(),
        user_id: user.0.user_id.clone(),
        user_name: user.0.user_name.clone(),
        session_name: request.session_name.clone(),
        collab_mode: false,
        is_active: false,
        last_heartbeat_at: None,
        last_heartbeat: None,
        last_state: None,
        runner_id: None,
        runner_name: None,
        is_ephemeral,
        expires_at: is_ephemeral.then(|| deadline_ms(state.settings.ephemeral_ttl)),
    };

    state.store.create_session(&session).await;
    state
        .archive
        .record_start(&SessionStartInput {
            session_id: session_id.clone(),
            user_id: session.user_id.clone(),
            user_name: session.user_name.clone(),
            session_name: session.session_name.clone(),
            cwd: session.cwd.clone(),
            share_url: session.share_url.clone(),
            is_ephemeral,
        })
        .await?;
    let _ = state
        .archive
        .record_recent_folder(user.id(), &request.cwd)
        .await;

    state
        .store
        .set_pending_link(&session_id, &request.runner_id)
        .await;
    state
        .to_runner(
            &request.runner_id,
            &RunnerServerEvent::NewSession {
                session_id: session_id.clone(),
                cwd: request.cwd,
                session_name: request.session_name,
                prompt: request.prompt,
            },
        )
        .await;

    info!(
        "session {session_id} spawn requested on runner {}",
        request.runner_id
    );
    Ok(Json(SpawnSessionResponse {
        session_id,
        share_url: session.share_url,
    }))
}

/// POST /api/sessions/{session_id}/kill
///
/// Idempotent: killing an already-gone session succeeds.
pub async fn kill_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let Some(session) = state.store.get_session(&session_id).await else {
        return Ok(StatusCode::NO_CONTENT);
    };
    if session.user_id != user.id() {
        return Err(ApiError::Unauthorized);
    }

    if let Some(runner_id) = &session.runner_id {
        state
            .to_runner(
                runner_id,
                &RunnerServerEvent::KillSession {
                    session_id: session_id.clone(),
                },
            )
            .await;
    }
    end_session(&state, &session, "Session killed").await;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Runners
// ============================================================================

async fn owned_runner(
    state: &AppState,
    user: &CurrentUser,
    runner_id: &str,
) -> ApiResult<()> {
    let runner = state
        .store
        .get_runner(runner_id)
        .await
        .ok_or_else(|| ApiError::not_found("runner not found"))?;
    if runner.user_id != user.id() {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// POST /api/runners/{runner_id}/restart
pub async fn restart_runner(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(runner_id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_runner(&state, &user, &runner_id).await?;
    state
        .to_runner(&runner_id, &RunnerServerEvent::Restart)
        .await;
    info!("restart requested for runner {runner_id}");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/runners/{runner_id}/shutdown
pub async fn shutdown_runner(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(runner_id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_runner(&state, &user, &runner_id).await?;
    state
        .to_runner(&runner_id, &RunnerServerEvent::Shutdown)
        .await;
    info!("shutdown requested for runner {runner_id}");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/folders/recent
pub async fn recent_folders(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.archive.recent_folders(user.id(), 20).await?))
}

// ============================================================================
// Push
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscribeRequest {
    pub endpoint: String,
    #[serde(default)]
    pub keys: Value,
    #[serde(default)]
    pub enabled_events: Option<String>,
}

/// POST /api/push/subscribe
pub async fn push_subscribe(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<PushSubscribeRequest>,
) -> ApiResult<StatusCode> {
    state
        .push
        .subscribe(
            user.id(),
            &request.endpoint,
            &request.keys,
            request.enabled_events.as_deref(),
        )
        .await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushUnsubscribeRequest {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<i64>,
}

/// POST /api/push/unsubscribe
pub async fn push_unsubscribe(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<PushUnsubscribeRequest>,
) -> ApiResult<StatusCode> {
    match (request.endpoint, request.subscription_id) {
        (Some(endpoint), _) => state.push.unsubscribe(user.id(), &endpoint).await?,
        (None, Some(id)) => state.push.unsubscribe_by_id(user.id(), id).await?,
        (None, None) => {
            return Err(ApiError::bad_request(
                "endpoint or subscriptionId is required",
            ));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/push/vapid-public-key
pub async fn vapid_public_key(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let vapid = state
        .settings
        .vapid
        .as_ref()
        .ok_or_else(|| ApiError::not_found("push is not configured"))?;
    Ok(Json(json!({"publicKey": vapid.public_key})))
}

// ============================================================================
// Attachments
// ============================================================================

/// POST /api/sessions/{session_id}/attachments (multipart, field `file`)
pub async fn upload_attachment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let owner_user_id = match state.store.get_session(&session_id).await {
        Some(session) => session.user_id,
        None => state
            .archive
            .get_snapshot(&session_id)
            .await?
            .map(|snapshot| snapshot.session.user_id)
            .ok_or_else(|| ApiError::not_found("session not found"))?,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .unwrap_or("attachment.bin")
            .to_string();
        let mime_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("reading upload: {err}")))?;

        if bytes.len() as u64 > state.attachments.max_bytes() {
            return Err(ApiError::PayloadTooLarge(format!(
                "attachment exceeds {} bytes",
                state.attachments.max_bytes()
            )));
        }

        let attachment = state
            .attachments
            .save(
                &session_id,
                &owner_user_id,
                user.id(),
                &filename,
                mime_type.as_deref(),
                &bytes,
            )
            .await?;
        return Ok(Json(serde_json::to_value(&attachment).unwrap_or_default()));
    }

    Err(ApiError::bad_request("missing `file` field"))
}

/// GET /api/attachments/{attachment_id}
pub async fn get_attachment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(attachment_id): Path<String>,
) -> ApiResult<Response> {
    let Some((meta, bytes)) = state.attachments.get(&attachment_id).await? else {
        return Err(ApiError::not_found("attachment not found"));
    };
    if meta.owner_user_id != user.id() && meta.uploader_user_id != user.id() {
        warn!(
            "user {} denied access to attachment {attachment_id}",
            user.id()
        );
        return Err(ApiError::not_found("attachment not found"));
    }

    Ok((
        [
            (header::CONTENT_TYPE, meta.mime_type.clone()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", meta.filename),
            ),
        ],
        bytes,
    )
        .into_response())
}
